//! Startup and shutdown ordering for the agent.
//!
//! Startup: load resources into the registry, open the ring buffer reader on
//! the events map, start the consumer, attach the probes. Any failure aborts
//! startup and releases what was already acquired.
//!
//! Shutdown: cancel, close the reader, wait for the consumer, close the
//! registry. The consumer is always stopped before the map backing its
//! reader is released.

use std::time::Duration;

use procevents_common::{EVENTS_MAP, EXEC_PROGRAM, EXIT_GROUP_PROGRAM, EXIT_PROGRAM, FORK_PROGRAM};
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
};
use tracing::{error, info, warn};

use crate::{
    decoder::{ByteOrder, Decoder},
    error::AgentError,
    registry::{Registry, Release, ResourceKind},
    ring::{self, Consumer, ConsumerReport, ConsumerState, EventSink, ReaderHandle, RecordSource},
    shutdown::CancellationSignal,
};

/// How long shutdown waits for the consumer after closing its reader.
pub const CONSUMER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// A tracepoint attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub program: &'static str,
    pub category: &'static str,
    pub name: &'static str,
}

/// Attached in this order at startup. The last two only feed the parent pid
/// and exit status into the records the first two emit.
pub const PROBES: [Probe; 4] = [
    Probe {
        program: EXEC_PROGRAM,
        category: "sched",
        name: "sched_process_exec",
    },
    Probe {
        program: EXIT_PROGRAM,
        category: "sched",
        name: "sched_process_exit",
    },
    Probe {
        program: FORK_PROGRAM,
        category: "sched",
        name: "sched_process_fork",
    },
    Probe {
        program: EXIT_GROUP_PROGRAM,
        category: "syscalls",
        name: "sys_enter_exit_group",
    },
];

/// The kernel side of the agent, as seen by the lifecycle.
pub trait Backend {
    type Resource: Release;
    type Source: RecordSource + 'static;

    /// Byte order of the records the loaded programs produce.
    fn byte_order(&self) -> ByteOrder;

    /// Loads every declared program and map.
    fn load(&mut self) -> Result<Registry<Self::Resource>, AgentError>;

    /// Opens a record source on the events map.
    fn open_reader(&mut self, events: &Self::Resource) -> Result<Self::Source, AgentError>;

    /// Attaches a probe, returning the live link.
    fn attach(&mut self, probe: &Probe) -> Result<Self::Resource, AgentError>;
}

pub struct Lifecycle<B> {
    backend: B,
    signal: CancellationSignal,
    join_timeout: Duration,
}

struct Running<R> {
    registry: Registry<R>,
    reader: ReaderHandle,
    consumer: JoinHandle<ConsumerReport>,
    consumer_state: watch::Receiver<ConsumerState>,
    finished: Option<Result<ConsumerReport, JoinError>>,
}

impl<B: Backend> Lifecycle<B> {
    pub fn new(backend: B, signal: CancellationSignal) -> Self {
        Self {
            backend,
            signal,
            join_timeout: CONSUMER_JOIN_TIMEOUT,
        }
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    /// Runs until cancellation, writing one JSON line per event to `sink`.
    pub async fn run(mut self, sink: EventSink) -> Result<(), AgentError> {
        info!("[Lifecycle] Starting up...");
        let decoder = Decoder::new(self.backend.byte_order());

        let mut registry = self.backend.load()?;
        info!("[Lifecycle] Loaded {} resource(s).", registry.len());

        let source = match registry.find(ResourceKind::Map, EVENTS_MAP) {
            Some(events) => self.backend.open_reader(events),
            None => Err(AgentError::resource_load(
                format!("map '{EVENTS_MAP}'"),
                "not present in the loaded object",
            )),
        };
        let source = match source {
            Ok(source) => source,
            Err(e) => {
                if let Err(release_err) = registry.close() {
                    warn!(error = ?release_err, "[Lifecycle] Release failed while aborting startup.");
                }
                return Err(e);
            }
        };
        let (reader, reader_handle) = ring::reader(source);

        let consumer = Consumer::new(reader, decoder, sink, self.signal.clone());
        let consumer_state = consumer.watch_state();
        let mut running = Running {
            registry,
            reader: reader_handle,
            consumer: consumer.spawn(),
            consumer_state,
            finished: None,
        };

        for probe in &PROBES {
            match self.backend.attach(probe) {
                Ok(link) => {
                    info!(
                        "[Lifecycle] Attached '{}' to {}/{}.",
                        probe.program, probe.category, probe.name
                    );
                    running.registry.insert(link);
                }
                Err(e) => {
                    error!("[Lifecycle] Probe attach failed, shutting down: {}", e);
                    if let Err(release_err) = self.shutdown(running).await {
                        warn!(error = ?release_err, "[Lifecycle] Release failed after attach error.");
                    }
                    return Err(e);
                }
            }
        }
        info!("[Lifecycle] All probes attached, streaming events.");

        tokio::select! {
            _ = self.signal.cancelled() => {
                info!("[Lifecycle] Cancellation requested.");
            }
            joined = &mut running.consumer => {
                warn!("[Lifecycle] Consumer stopped before cancellation, shutting down.");
                running.finished = Some(joined);
            }
        }

        self.shutdown(running).await
    }

    async fn shutdown(&self, running: Running<B::Resource>) -> Result<(), AgentError> {
        let Running {
            registry,
            reader,
            consumer,
            consumer_state,
            finished,
        } = running;

        self.signal.cancel();
        reader.close();

        let joined = match finished {
            Some(joined) => Some(joined),
            None => {
                let abort = consumer.abort_handle();
                match tokio::time::timeout(self.join_timeout, consumer).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        let state = *consumer_state.borrow();
                        warn!(
                            "[Lifecycle] Consumer did not stop within {:?} (state {:?}), aborting it.",
                            self.join_timeout, state
                        );
                        abort.abort();
                        None
                    }
                }
            }
        };
        match joined {
            Some(Ok(report)) => info!(
                "[Lifecycle] Consumer {:?}: {} emitted, {} dropped.",
                report.state, report.emitted, report.dropped
            ),
            Some(Err(e)) => warn!(error = ?e, "[Lifecycle] Consumer task failed."),
            None => {}
        }

        registry.close()?;
        info!("[Lifecycle] Shutdown completed.");
        Ok(())
    }
}
