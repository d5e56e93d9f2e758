use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};

use crate::{
    transport::{SenderLink, Transport, TransportError},
    BrokerConfig, OutboundMessage, ReadinessGate, TerminationSignal, WORK_QUEUE_DEPTH,
};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Transport Error: {0}")]
    Transport(#[from] TransportError),
    #[error("Invalid session transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
    #[error("Work queue closed")]
    WorkQueueClosed,
}

/// Life cycle of one [`BrokerSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    LinkOpening,
    Ready,
    Closed,
    Failed,
}

impl SessionState {
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, LinkOpening)
                | (LinkOpening, Ready)
                // only taken when automatic reconnection is enabled
                | (Ready, Connecting)
                | (Connecting | LinkOpening | Ready, Closed)
                | (Connecting | LinkOpening | Ready, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

type WorkQueue = Option<mpsc::Sender<OutboundMessage>>;

/// Cross-thread entry point for relaying messages through whichever session
/// is currently ready. Cheap to clone.
///
/// The session publishes its work queue here when its sender link opens and
/// withdraws it the moment it leaves [`SessionState::Ready`]; sends issued
/// while nothing is published are dropped, never buffered for later.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    work_queue: Arc<watch::Sender<WorkQueue>>,
}

impl Default for SessionHandle {
    fn default() -> Self {
        let (work_queue, _) = watch::channel(None);
        Self {
            work_queue: Arc::new(work_queue),
        }
    }
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking hand off to the session thread. Returns `false` when the
    /// message was dropped (no ready session, or the queue is saturated).
    pub fn enqueue_send(&self, message: OutboundMessage) -> bool {
        let work_queue = self.work_queue.borrow();
        let Some(queue) = work_queue.as_ref() else {
            log::trace!("No ready broker session, dropping message");
            return false;
        };

        match queue.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Broker work queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::trace!("Broker work queue closed, dropping message");
                false
            }
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.work_queue.borrow().is_some()
    }

    pub(crate) fn publish(&self, queue: mpsc::Sender<OutboundMessage>) {
        self.work_queue.send_replace(Some(queue));
    }

    pub(crate) fn withdraw(&self) {
        self.work_queue.send_replace(None);
    }
}

/// Shared pieces every session attempt plugs into
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub handle: SessionHandle,
    pub readiness: Arc<ReadinessGate>,
    pub termination: Arc<TerminationSignal>,
}

// Redial schedule used when automatic reconnection is enabled
const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(10);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct ReconnectBackoff {
    next: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            next: RECONNECT_INITIAL_DELAY,
        }
    }
}

impl ReconnectBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(RECONNECT_MAX_DELAY);
        delay
    }

    fn reset(&mut self) {
        self.next = RECONNECT_INITIAL_DELAY;
    }
}

enum LinkEnd {
    Terminated,
    Lost(TransportError),
}

/// One attempt at connecting to the broker and relaying messages over a
/// sender link. Every transport call runs on the task driving
/// [`BrokerSession::start`]; other threads only reach the link through the
/// [`SessionHandle`].
pub struct BrokerSession<T: Transport> {
    config: Arc<BrokerConfig>,
    transport: T,
    context: SessionContext,
    state: SessionState,
}

impl<T: Transport> BrokerSession<T> {
    pub fn new(config: Arc<BrokerConfig>, transport: T, context: SessionContext) -> Self {
        Self {
            config,
            transport,
            context,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) -> Result<(), BrokerError> {
        if !self.state.can_transition(next) {
            return Err(BrokerError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        log::debug!("Broker session {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Run the session until termination is raised (`Ok`) or the connection
    /// fails for good (`Err`)
    pub async fn start(&mut self) -> Result<(), BrokerError> {
        if self.state != SessionState::Idle {
            return Err(BrokerError::InvalidTransition {
                from: self.state,
                to: SessionState::Connecting,
            });
        }

        self.config.options.log_summary();
        let result = self.run().await;
        self.context.handle.withdraw();
        self.transport.close().await;

        match &result {
            Ok(()) => {
                self.transition(SessionState::Closed)?;
                log::info!("Broker session closed");
            }
            Err(e) => {
                if !self.state.is_terminal() {
                    self.state = SessionState::Failed;
                }
                log::error!("Broker session failed: {e}");
            }
        }
        result
    }

    async fn run(&mut self) -> Result<(), BrokerError> {
        let termination = self.context.termination.clone();
        let mut backoff = ReconnectBackoff::default();

        loop {
            self.transition(SessionState::Connecting)?;
            if !self.connect(&mut backoff, &termination).await? {
                return Ok(());
            }
            backoff.reset();

            self.transition(SessionState::LinkOpening)?;
            log::info!("Opening sender to {}", self.config.queue);
            let link = tokio::select! {
                biased;
                _ = termination.raised() => return Ok(()),
                link = self.transport.open_sender(&self.config.queue) => link?,
            };

            match self.relay(link, &termination).await? {
                LinkEnd::Terminated => return Ok(()),
                LinkEnd::Lost(e) if self.config.options.reconnect => {
                    log::warn!("Sender link lost ({e}), reconnecting");
                    self.transport.close().await;
                }
                LinkEnd::Lost(e) => return Err(e.into()),
            }
        }
    }

    /// Returns `Ok(false)` if termination was raised before a connection was made
    async fn connect(
        &mut self,
        backoff: &mut ReconnectBackoff,
        termination: &TerminationSignal,
    ) -> Result<bool, BrokerError> {
        loop {
            log::info!("Connecting to {}", self.config.address);
            let attempt = tokio::select! {
                biased;
                _ = termination.raised() => return Ok(false),
                attempt = self.transport.connect() => attempt,
            };

            match attempt {
                Ok(()) => return Ok(true),
                Err(e) if self.config.options.reconnect => {
                    let delay = backoff.next_delay();
                    log::warn!("Connection attempt failed ({e}), retrying in {delay:?}");
                    tokio::select! {
                        biased;
                        _ = termination.raised() => return Ok(false),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn relay(
        &mut self,
        mut link: T::Link,
        termination: &TerminationSignal,
    ) -> Result<LinkEnd, BrokerError> {
        let (queue, mut work) = mpsc::channel(WORK_QUEUE_DEPTH);

        self.transition(SessionState::Ready)?;
        self.context.handle.publish(queue);
        if self.context.readiness.open() {
            log::info!("Sender ready, relaying to {}", self.config.queue);
        } else {
            log::info!("Sender ready again, relaying to {}", self.config.queue);
        }

        let end = loop {
            tokio::select! {
                biased;
                _ = termination.raised() => break LinkEnd::Terminated,
                e = link.closed() => break LinkEnd::Lost(e),
                message = work.recv() => {
                    let Some(message) = message else {
                        self.context.handle.withdraw();
                        return Err(BrokerError::WorkQueueClosed);
                    };
                    if let Err(e) = link.send(message).await {
                        break LinkEnd::Lost(e);
                    }
                }
            }
        };

        self.context.handle.withdraw();
        if let LinkEnd::Terminated = end {
            // hand over what was already accepted before detaching
            let mut drained = 0usize;
            while let Ok(message) = work.try_recv() {
                if let Err(e) = link.send(message).await {
                    log::warn!("Dropping queued messages, send failed during shutdown: {e}");
                    break;
                }
                drained += 1;
            }
            if drained > 0 {
                log::info!("Flushed {drained} queued message(s) before closing");
            }
            link.close().await;
        }
        Ok(end)
    }
}
