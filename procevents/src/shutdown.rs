//! Process-wide cancellation state.
//!
//! Created once in `main` and handed by reference to whatever needs to
//! observe or trigger shutdown. The state only moves forward:
//! `Running -> Cancelling -> ForcedExit`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Cancelling,
    ForcedExit,
}

#[derive(Debug, Clone)]
pub struct CancellationSignal {
    state: Arc<watch::Sender<ShutdownState>>,
    signal_handler_installed: Arc<AtomicBool>,
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            state: Arc::new(state),
            signal_handler_installed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    /// Requests graceful shutdown. Returns `true` if this call made the
    /// transition.
    pub fn cancel(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Cancelling;
                true
            } else {
                false
            }
        })
    }

    /// Advances one step in response to a termination signal and returns
    /// the new state.
    pub fn escalate(&self) -> ShutdownState {
        self.state.send_modify(|state| {
            *state = match *state {
                ShutdownState::Running => ShutdownState::Cancelling,
                ShutdownState::Cancelling | ShutdownState::ForcedExit => ShutdownState::ForcedExit,
            }
        });
        self.state()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|state| *state != ShutdownState::Running).await;
    }

    /// Marks the OS signal handler as installed.
    ///
    /// # Panics
    ///
    /// If called twice for the same signal; a second handler is a bug.
    pub(crate) fn claim_signal_handler(&self) {
        if self.signal_handler_installed.swap(true, Ordering::SeqCst) {
            panic!("termination signal handler installed twice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn escalation_runs_to_forced_exit() {
        let signal = CancellationSignal::new();
        assert_eq!(signal.state(), ShutdownState::Running);
        assert!(!signal.is_cancelled());

        assert_eq!(signal.escalate(), ShutdownState::Cancelling);
        assert!(signal.is_cancelled());
        assert_eq!(signal.escalate(), ShutdownState::ForcedExit);
        assert_eq!(signal.escalate(), ShutdownState::ForcedExit);
    }

    #[test]
    fn cancel_only_transitions_once() {
        let signal = CancellationSignal::new();
        assert!(signal.cancel());
        assert!(!signal.cancel());
        assert_eq!(signal.state(), ShutdownState::Cancelling);
    }

    #[test]
    fn cancel_does_not_force_exit() {
        let signal = CancellationSignal::new();
        signal.escalate();
        assert!(!signal.cancel());
        assert_eq!(signal.state(), ShutdownState::Cancelling);
    }

    #[test]
    fn clones_share_state() {
        let signal = CancellationSignal::new();
        let observer = signal.clone();
        signal.cancel();
        assert!(observer.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let signal = CancellationSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        signal.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_cancelled() {
        let signal = CancellationSignal::new();
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("already cancelled");
    }

    #[test]
    #[should_panic(expected = "installed twice")]
    fn second_handler_claim_panics() {
        let signal = CancellationSignal::new();
        signal.claim_signal_handler();
        signal.clone().claim_signal_handler();
    }
}
