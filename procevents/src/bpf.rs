use std::{
    io,
    os::fd::AsFd,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use aya::{
    maps::{Map, MapData, RingBuf},
    programs::{links::Link, trace_point::TracePointLink, TracePoint},
    Ebpf,
};
use nix::sys::resource::{setrlimit, Resource as Rlimit, RLIM_INFINITY};
use procevents_common::{EVENTS_MAP, EXEC_PROGRAM, EXIT_GROUP_PROGRAM, EXIT_PROGRAM, FORK_PROGRAM};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info};

use crate::{
    decoder::ByteOrder,
    error::{AgentError, BoxError},
    lifecycle::{Backend, Probe},
    registry::{Registry, Release, ResourceKind},
    ring::RecordSource,
};

/// Programs loaded from the artifact, in registry order.
const PROGRAMS: [&str; 4] = [EXEC_PROGRAM, EXIT_PROGRAM, FORK_PROGRAM, EXIT_GROUP_PROGRAM];

/// A kernel object owned by the registry.
pub enum Resource {
    /// Loaded program; the code stays in the shared `Ebpf` object.
    Program {
        name: String,
        bpf: Arc<Mutex<Ebpf>>,
    },
    Link {
        name: String,
        link: TracePointLink,
    },
    Map {
        name: String,
        map: Map,
    },
}

impl Release for Resource {
    fn kind(&self) -> ResourceKind {
        match self {
            Resource::Program { .. } => ResourceKind::Program,
            Resource::Link { .. } => ResourceKind::Link,
            Resource::Map { .. } => ResourceKind::Map,
        }
    }

    fn name(&self) -> &str {
        match self {
            Resource::Program { name, .. }
            | Resource::Link { name, .. }
            | Resource::Map { name, .. } => name,
        }
    }

    fn release(self) -> Result<(), BoxError> {
        match self {
            Resource::Program { name, bpf } => {
                let mut bpf = bpf
                    .lock()
                    .map_err(|e| format!("eBPF object lock poisoned: {e}"))?;
                let program: &mut TracePoint = bpf
                    .program_mut(&name)
                    .ok_or_else(|| format!("program '{name}' no longer present"))?
                    .try_into()?;
                program.unload()?;
                Ok(())
            }
            Resource::Link { link, .. } => Ok(link.detach()?),
            // Closing the map fd is the release; the kernel frees it once the
            // last reference is gone.
            Resource::Map { map, .. } => {
                drop(map);
                Ok(())
            }
        }
    }
}

/// Loads the embedded artifact with aya and exposes it to the lifecycle.
pub struct EbpfBackend {
    artifact: &'static [u8],
    byte_order: ByteOrder,
    bpf: Option<Arc<Mutex<Ebpf>>>,
}

impl EbpfBackend {
    /// Validates the artifact and reads its byte order. Nothing is loaded
    /// into the kernel yet.
    pub fn parse(artifact: &'static [u8]) -> Result<Self, AgentError> {
        let byte_order = ByteOrder::from_elf_ident(artifact).ok_or_else(|| {
            AgentError::resource_load(
                "embedded eBPF artifact",
                format!("not an ELF object ({} bytes)", artifact.len()),
            )
        })?;
        debug!("[Backend] Artifact is {:?}-endian.", byte_order);

        Ok(Self {
            artifact,
            byte_order,
            bpf: None,
        })
    }

    fn loaded(&self) -> Result<&Arc<Mutex<Ebpf>>, BoxError> {
        self.bpf
            .as_ref()
            .ok_or_else(|| "eBPF object not loaded".into())
    }
}

impl Backend for EbpfBackend {
    type Resource = Resource;
    type Source = EventRing;

    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn load(&mut self) -> Result<Registry<Resource>, AgentError> {
        raise_memlock_limit();

        let mut bpf =
            Ebpf::load(self.artifact).map_err(|e| AgentError::resource_load("eBPF object", e))?;

        for name in PROGRAMS {
            let what = || format!("program '{name}'");
            let program: &mut TracePoint = bpf
                .program_mut(name)
                .ok_or_else(|| AgentError::resource_load(what(), "not found in object"))?
                .try_into()
                .map_err(|e| AgentError::resource_load(what(), e))?;
            program
                .load()
                .map_err(|e| AgentError::resource_load(what(), e))?;
            debug!("[Backend] Program '{}' loaded.", name);
        }

        let events = bpf.take_map(EVENTS_MAP).ok_or_else(|| {
            AgentError::resource_load(format!("map '{EVENTS_MAP}'"), "not found in object")
        })?;
        if !matches!(events, Map::RingBuf(_)) {
            return Err(AgentError::resource_load(
                format!("map '{EVENTS_MAP}'"),
                "not a ring buffer",
            ));
        }

        let bpf = Arc::new(Mutex::new(bpf));
        let mut registry = Registry::new();
        for name in PROGRAMS {
            registry.insert(Resource::Program {
                name: name.to_owned(),
                bpf: Arc::clone(&bpf),
            });
        }
        registry.insert(Resource::Map {
            name: EVENTS_MAP.to_owned(),
            map: events,
        });
        self.bpf = Some(bpf);

        info!("[Backend] eBPF object loaded.");
        Ok(registry)
    }

    fn open_reader(&mut self, events: &Resource) -> Result<EventRing, AgentError> {
        let Resource::Map {
            name,
            map: Map::RingBuf(data),
        } = events
        else {
            return Err(AgentError::ReaderOpen {
                map: events.name().to_owned(),
                source: "not a ring buffer map".into(),
            });
        };
        let reader_open = |source: BoxError| AgentError::ReaderOpen {
            map: name.clone(),
            source,
        };

        // The reader gets its own fd so the registry keeps sole ownership of
        // the map handle it releases at shutdown.
        let fd = data
            .fd()
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| reader_open(e.into()))?;
        let data = MapData::from_fd(fd).map_err(|e| reader_open(e.into()))?;
        let ring = RingBuf::try_from(Map::RingBuf(data)).map_err(|e| reader_open(e.into()))?;
        let ring = AsyncFd::new(ring).map_err(|e| reader_open(e.into()))?;

        info!("[Backend] Ring buffer reader opened on '{}'.", name);
        Ok(EventRing { ring })
    }

    fn attach(&mut self, probe: &Probe) -> Result<Resource, AgentError> {
        let attach_error = |source: BoxError| AgentError::Attach {
            program: probe.program.to_owned(),
            category: probe.category.to_owned(),
            name: probe.name.to_owned(),
            source,
        };

        let bpf = self.loaded().map_err(attach_error)?;
        let mut bpf = bpf
            .lock()
            .map_err(|e| attach_error(format!("eBPF object lock poisoned: {e}").into()))?;
        let program: &mut TracePoint = bpf
            .program_mut(probe.program)
            .ok_or_else(|| attach_error("program not found".into()))?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| attach_error(e.into()))?;

        let link_id = program
            .attach(probe.category, probe.name)
            .map_err(|e| attach_error(e.into()))?;
        let link = program
            .take_link(link_id)
            .map_err(|e| attach_error(e.into()))?;

        Ok(Resource::Link {
            name: format!("{}:{}/{}", probe.program, probe.category, probe.name),
            link,
        })
    }
}

/// `EVENTS` ring buffer driven by tokio readiness.
pub struct EventRing {
    ring: AsyncFd<RingBuf<MapData>>,
}

#[async_trait]
impl RecordSource for EventRing {
    async fn next_record(&mut self) -> io::Result<Vec<u8>> {
        loop {
            let mut guard = self.ring.readable_mut().await?;
            if let Some(item) = guard.get_inner_mut().next() {
                return Ok(item.to_vec());
            }
            guard.clear_ready();
        }
    }
}

/// Older kernels account BPF memory against RLIMIT_MEMLOCK.
fn raise_memlock_limit() {
    if let Err(e) = setrlimit(Rlimit::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY) {
        debug!("[Backend] Failed to remove memlock limit: {}", e);
    }
}
