use tokio::{
    signal::unix::{self, Signal, SignalKind},
    task::JoinHandle,
};
use tracing::{error, info};

use crate::{
    error::AgentError,
    shutdown::{CancellationSignal, ShutdownState},
};

/// Maps SIGINT/SIGTERM onto the cancellation signal.
///
/// The first termination signal starts graceful shutdown; the second exits
/// the process with status 1 without waiting for cleanup.
pub struct SignalHandler {
    term_signal: Signal,
    int_signal: Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGTERM
    Terminate,
    /// SIGINT (Ctrl+C)
    Interrupt,
}

impl SignalHandler {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            term_signal: unix::signal(SignalKind::terminate())?,
            int_signal: unix::signal(SignalKind::interrupt())?,
        })
    }

    /// Registers the OS handlers and spawns the task driving `signal`.
    ///
    /// Handlers are registered before this returns, so a signal delivered
    /// right after is not lost.
    ///
    /// # Panics
    ///
    /// If a handler was already installed for `signal`.
    pub fn install(signal: &CancellationSignal) -> Result<JoinHandle<()>, AgentError> {
        signal.claim_signal_handler();
        let mut handler = Self::new().map_err(AgentError::Signal)?;
        let signal = signal.clone();

        Ok(tokio::spawn(async move {
            loop {
                let event = handler.wait_for_signal().await;
                if signal.escalate() == ShutdownState::ForcedExit {
                    error!(
                        "[SignalHandler] Received {:?} during shutdown, exiting immediately.",
                        event
                    );
                    eprintln!("error: second termination signal received, forcing exit");
                    std::process::exit(1);
                }
                info!(
                    "[SignalHandler] Received {:?}, initiating graceful shutdown.",
                    event
                );
            }
        }))
    }

    /// Waits for the next termination signal.
    pub async fn wait_for_signal(&mut self) -> SignalEvent {
        tokio::select! {
            _ = self.term_signal.recv() => SignalEvent::Terminate,
            _ = self.int_signal.recv() => SignalEvent::Interrupt,
        }
    }
}
