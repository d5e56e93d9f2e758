use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::Notify;

/// Why the relay is stopping. Decides the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Operator requested stop or the broker session ended cleanly
    Shutdown,
    /// Unrecoverable failure, e.g. broker unreachable with no retry configured
    Fault,
}

const LIVE: u8 = 0;
const SHUTDOWN: u8 = 1;
const FAULT: u8 = 2;

/// One-shot, level triggered stop signal shared by the ingest loop and the
/// broker session thread.
///
/// Checking is a single atomic load; [`TerminationSignal::raised`] is a future
/// that can sit in the same `select!` as a socket read, so a raise from
/// another thread wakes a blocked wait. Once raised it stays raised, and the
/// first cause wins.
#[derive(Debug, Default)]
pub struct TerminationSignal {
    state: AtomicU8,
    notify: Notify,
}

impl TerminationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns `true` only for the call that actually
    /// raised it, later calls keep the original cause.
    pub fn raise(&self, cause: Termination) -> bool {
        let code = match cause {
            Termination::Shutdown => SHUTDOWN,
            Termination::Fault => FAULT,
        };

        let first = self
            .state
            .compare_exchange(LIVE, code, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if first {
            log::debug!("Termination raised: {cause:?}");
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_raised(&self) -> bool {
        self.state.load(Ordering::Acquire) != LIVE
    }

    pub fn cause(&self) -> Option<Termination> {
        match self.state.load(Ordering::Acquire) {
            SHUTDOWN => Some(Termination::Shutdown),
            FAULT => Some(Termination::Fault),
            _ => None,
        }
    }

    /// Resolves once the signal is raised (immediately if it already is)
    pub async fn raised(&self) -> Termination {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a raise in between is not lost
            notified.as_mut().enable();

            if let Some(cause) = self.cause() {
                return cause;
            }
            notified.await;
        }
    }
}

/// Write-once flag telling the ingest side that a sender link has been open
/// at least once. It never reverts, a dropped link does not clear it.
#[derive(Debug, Default)]
pub struct ReadinessGate {
    ready: AtomicBool,
    notify: Notify,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the gate open. Returns `true` the first time only.
    pub fn open(&self) -> bool {
        let first = !self.ready.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }

    /// Wait for the gate, giving up early if `termination` is raised first.
    /// Returns whether the gate is open.
    pub async fn wait_or_terminated(&self, termination: &TerminationSignal) -> bool {
        tokio::select! {
            biased;
            _ = self.wait() => true,
            _ = termination.raised() => self.is_ready(),
        }
    }
}
