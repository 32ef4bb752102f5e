//! Ownership and ordered release of kernel-attached resources.
//!
//! The registry keeps three disjoint groups: programs, links and maps. It is
//! filled once during startup and closed exactly once at shutdown; closing
//! consumes it, so there is no second close path to guard against.
//!
//! Within a group, release is fail-fast: the first failure stops the group
//! and the members after it stay unreleased. Groups are independent of each
//! other, and are always closed programs first, then links, then maps, since
//! programs and links may still reference a map while they are torn down.

use std::{collections::VecDeque, fmt};

use tracing::{debug, info, warn};

use crate::error::{BoxError, ReleaseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Program,
    Link,
    Map,
}

impl ResourceKind {
    /// Whole-registry close order.
    pub const CLOSE_ORDER: [ResourceKind; 3] =
        [ResourceKind::Program, ResourceKind::Link, ResourceKind::Map];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Program => "program",
            ResourceKind::Link => "link",
            ResourceKind::Map => "map",
        };
        f.write_str(s)
    }
}

/// A resource the registry can own and release.
pub trait Release {
    fn kind(&self) -> ResourceKind;

    fn name(&self) -> &str;

    fn release(self) -> Result<(), BoxError>;
}

/// Members of one kind, released in insertion order.
#[derive(Debug)]
pub struct ResourceGroup<R> {
    kind: ResourceKind,
    members: VecDeque<R>,
}

impl<R: Release> ResourceGroup<R> {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            members: VecDeque::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &R> {
        self.members.iter()
    }

    fn push(&mut self, resource: R) {
        debug_assert_eq!(resource.kind(), self.kind);
        self.members.push_back(resource);
    }

    /// Releases every member in order, stopping at the first failure.
    ///
    /// Members after the failing one remain in the group.
    pub fn close_all(&mut self) -> Result<(), ReleaseError> {
        while let Some(resource) = self.members.pop_front() {
            let kind = resource.kind();
            let name = resource.name().to_owned();
            match resource.release() {
                Ok(()) => debug!("[Registry] Released {} '{}'.", kind, name),
                Err(source) => {
                    if !self.members.is_empty() {
                        warn!(
                            "[Registry] {} {}(s) left unreleased after '{}' failed.",
                            self.members.len(),
                            kind,
                            name
                        );
                    }
                    return Err(ReleaseError { kind, name, source });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Registry<R> {
    programs: ResourceGroup<R>,
    links: ResourceGroup<R>,
    maps: ResourceGroup<R>,
}

impl<R: Release> Default for Registry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Release> Registry<R> {
    pub fn new() -> Self {
        Self {
            programs: ResourceGroup::new(ResourceKind::Program),
            links: ResourceGroup::new(ResourceKind::Link),
            maps: ResourceGroup::new(ResourceKind::Map),
        }
    }

    /// Adds a resource to the group matching its kind.
    pub fn insert(&mut self, resource: R) {
        self.group_mut(resource.kind()).push(resource);
    }

    pub fn group(&self, kind: ResourceKind) -> &ResourceGroup<R> {
        match kind {
            ResourceKind::Program => &self.programs,
            ResourceKind::Link => &self.links,
            ResourceKind::Map => &self.maps,
        }
    }

    fn group_mut(&mut self, kind: ResourceKind) -> &mut ResourceGroup<R> {
        match kind {
            ResourceKind::Program => &mut self.programs,
            ResourceKind::Link => &mut self.links,
            ResourceKind::Map => &mut self.maps,
        }
    }

    pub fn find(&self, kind: ResourceKind, name: &str) -> Option<&R> {
        self.group(kind).iter().find(|r| r.name() == name)
    }

    pub fn len(&self) -> usize {
        self.programs.len() + self.links.len() + self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_group(&mut self, kind: ResourceKind) -> Result<(), ReleaseError> {
        self.group_mut(kind).close_all()
    }

    /// Closes programs, links, then maps.
    ///
    /// Every group is attempted even when an earlier one fails. The first
    /// group error is returned; later ones are logged.
    pub fn close(mut self) -> Result<(), ReleaseError> {
        info!(
            "[Registry] Closing {} program(s), {} link(s), {} map(s).",
            self.programs.len(),
            self.links.len(),
            self.maps.len()
        );

        let mut first_error = None;
        for kind in ResourceKind::CLOSE_ORDER {
            if let Err(e) = self.close_group(kind) {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    warn!(error = ?e, "[Registry] Further release failure in {} group.", kind);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("[Registry] All resources released.");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records releases into a shared log and optionally fails.
    #[derive(Debug)]
    pub(crate) struct FakeResource {
        pub kind: ResourceKind,
        pub name: String,
        pub fail: bool,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeResource {
        pub fn new(kind: ResourceKind, name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                kind,
                name: name.to_owned(),
                fail: false,
                log: Arc::clone(log),
            }
        }

        pub fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    impl Release for FakeResource {
        fn kind(&self) -> ResourceKind {
            self.kind
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn release(self) -> Result<(), BoxError> {
            self.log.lock().unwrap().push(self.name.clone());
            if self.fail {
                Err(format!("{} is busy", self.name).into())
            } else {
                Ok(())
            }
        }
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn populated(log: &Arc<Mutex<Vec<String>>>) -> Registry<FakeResource> {
        let mut registry = Registry::new();
        // inserted out of close order on purpose
        registry.insert(FakeResource::new(ResourceKind::Map, "events", log));
        registry.insert(FakeResource::new(ResourceKind::Link, "exec_link", log));
        registry.insert(FakeResource::new(ResourceKind::Program, "handle_exec", log));
        registry.insert(FakeResource::new(ResourceKind::Link, "exit_link", log));
        registry.insert(FakeResource::new(ResourceKind::Program, "handle_exit", log));
        registry
    }

    #[test]
    fn close_releases_programs_then_links_then_maps() {
        let log = log();
        populated(&log).close().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["handle_exec", "handle_exit", "exec_link", "exit_link", "events"]
        );
    }

    #[test]
    fn group_close_stops_at_first_failure() {
        let log = log();
        let mut group = ResourceGroup::new(ResourceKind::Link);
        group.push(FakeResource::new(ResourceKind::Link, "a", &log));
        group.push(FakeResource::new(ResourceKind::Link, "b", &log).failing());
        group.push(FakeResource::new(ResourceKind::Link, "c", &log));

        let err = group.close_all().unwrap_err();
        assert_eq!(err.kind, ResourceKind::Link);
        assert_eq!(err.name, "b");
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(group.len(), 1, "'c' is left for the caller");
        assert_eq!(group.iter().next().unwrap().name, "c");
    }

    #[test]
    fn failing_program_group_still_closes_links_and_maps() {
        let log = log();
        let mut registry = Registry::new();
        registry.insert(FakeResource::new(ResourceKind::Program, "p1", &log).failing());
        registry.insert(FakeResource::new(ResourceKind::Program, "p2", &log));
        registry.insert(FakeResource::new(ResourceKind::Link, "l1", &log));
        registry.insert(FakeResource::new(ResourceKind::Map, "m1", &log));

        let err = registry.close().unwrap_err();
        assert_eq!(err.kind, ResourceKind::Program);
        assert_eq!(err.name, "p1");
        assert_eq!(*log.lock().unwrap(), vec!["p1", "l1", "m1"]);
    }

    #[test]
    fn first_group_error_wins() {
        let log = log();
        let mut registry = Registry::new();
        registry.insert(FakeResource::new(ResourceKind::Link, "l1", &log).failing());
        registry.insert(FakeResource::new(ResourceKind::Map, "m1", &log).failing());

        let err = registry.close().unwrap_err();
        assert_eq!(err.kind, ResourceKind::Link);
        assert_eq!(*log.lock().unwrap(), vec!["l1", "m1"]);
        assert_eq!(err.to_string(), "failed to release link 'l1'");
    }

    #[test]
    fn find_looks_up_by_kind_and_name() {
        let log = log();
        let registry = populated(&log);
        assert_eq!(registry.len(), 5);
        assert!(registry.find(ResourceKind::Map, "events").is_some());
        assert!(registry.find(ResourceKind::Program, "events").is_none());
        assert_eq!(registry.group(ResourceKind::Link).len(), 2);
    }

    #[test]
    fn empty_registry_closes_cleanly() {
        let registry: Registry<FakeResource> = Registry::default();
        assert!(registry.is_empty());
        registry.close().unwrap();
    }
}
