//! Ring buffer consumption: one background task that reads records, decodes
//! them and writes one JSON line per event.
//!
//! The task checks the cancellation signal between reads, but a read that is
//! already waiting only returns when a record arrives or the reader is
//! closed through its [`ReaderHandle`]. Closing is what actually stops it.

use std::{io, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{decoder::Decoder, error::ReadError, shutdown::CancellationSignal};

/// Pause after a transient read error before trying again.
pub const TRANSIENT_BACKOFF: Duration = Duration::from_millis(10);

/// Destination of the JSON lines. Writes are async so an aborted loop never
/// leaves a worker thread stuck on a full pipe.
pub type EventSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Where raw records come from.
#[async_trait]
pub trait RecordSource: Send {
    /// Waits for the next record.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a record.
    async fn next_record(&mut self) -> io::Result<Vec<u8>>;
}

/// Wraps `source` in a reader that can be closed from another task.
pub fn reader<S: RecordSource>(source: S) -> (RingReader<S>, ReaderHandle) {
    let (closed_tx, closed_rx) = watch::channel(false);
    (
        RingReader {
            source,
            closed: closed_rx,
        },
        ReaderHandle { closed: closed_tx },
    )
}

pub struct RingReader<S> {
    source: S,
    closed: watch::Receiver<bool>,
}

impl<S: RecordSource> RingReader<S> {
    /// Blocks until a record is available or the reader is closed.
    ///
    /// A close takes priority over a record that is ready at the same time.
    pub async fn read(&mut self) -> Result<Vec<u8>, ReadError> {
        tokio::select! {
            biased;
            _ = wait_closed(&mut self.closed) => Err(ReadError::Closed),
            record = self.source.next_record() => record.map_err(ReadError::Transient),
        }
    }
}

// Dropping the handle without closing also counts as closed.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Closes the matching [`RingReader`], unblocking any read in flight.
#[derive(Debug)]
pub struct ReaderHandle {
    closed: watch::Sender<bool>,
}

impl ReaderHandle {
    pub fn close(&self) {
        self.closed.send_replace(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ReaderClosed,
    Cancelled,
}

/// What the loop did before it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerReport {
    pub emitted: u64,
    pub dropped: u64,
    pub read_errors: u64,
    pub stop_reason: StopReason,
    pub state: ConsumerState,
}

pub struct Consumer<S> {
    reader: RingReader<S>,
    decoder: Decoder,
    sink: EventSink,
    signal: CancellationSignal,
    state: watch::Sender<ConsumerState>,
    emitted: u64,
    dropped: u64,
    read_errors: u64,
}

impl<S: RecordSource + 'static> Consumer<S> {
    pub fn new(
        reader: RingReader<S>,
        decoder: Decoder,
        sink: EventSink,
        signal: CancellationSignal,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            reader,
            decoder,
            sink,
            signal,
            state,
            emitted: 0,
            dropped: 0,
            read_errors: 0,
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Follows the loop state after the consumer has been moved into its task.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Starts the loop as a background task.
    pub fn spawn(self) -> JoinHandle<ConsumerReport> {
        self.state.send_replace(ConsumerState::Running);
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> ConsumerReport {
        info!("[Consumer] Ring buffer consumer started.");

        let stop_reason = loop {
            if self.signal.is_cancelled() {
                break StopReason::Cancelled;
            }

            match self.reader.read().await {
                Ok(record) => self.handle_record(&record).await,
                Err(ReadError::Closed) => break StopReason::ReaderClosed,
                Err(e @ ReadError::Transient(_)) => {
                    self.read_errors += 1;
                    warn!(error = ?e, "[Consumer] Ring buffer read failed, continuing.");
                    tokio::time::sleep(TRANSIENT_BACKOFF).await;
                }
            }
        };

        self.state.send_replace(ConsumerState::Stopped);
        info!(
            "[Consumer] Stopped ({:?}): {} emitted, {} dropped, {} read errors.",
            stop_reason, self.emitted, self.dropped, self.read_errors
        );
        ConsumerReport {
            emitted: self.emitted,
            dropped: self.dropped,
            read_errors: self.read_errors,
            stop_reason,
            state: self.state(),
        }
    }

    async fn handle_record(&mut self, record: &[u8]) {
        let event = match self.decoder.decode_event(record) {
            Ok(event) => event,
            Err(e) => {
                self.dropped += 1;
                warn!("[Consumer] Dropping record of {} bytes: {}", record.len(), e);
                return;
            }
        };

        let mut line = match event.to_json() {
            Ok(line) => line,
            Err(e) => {
                self.dropped += 1;
                warn!("[Consumer] Failed to serialize event for pid {}: {}", event.pid, e);
                return;
            }
        };

        line.push('\n');
        let written = match self.sink.write_all(line.as_bytes()).await {
            Ok(()) => self.sink.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {
                self.emitted += 1;
                debug!("[Consumer] Emitted event for pid {}.", event.pid);
            }
            Err(e) => {
                self.dropped += 1;
                warn!("[Consumer] Failed to write event for pid {}: {}", event.pid, e);
            }
        }
    }
}
