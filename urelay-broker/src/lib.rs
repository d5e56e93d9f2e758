//! The `urelay-broker` crate is the broker side of the relayer: it owns the
//! AMQP 1.0 connection and a single sender link, and exposes a thread safe
//! handle so the UDP ingest side can hand messages over without ever touching
//! the connection itself.
//!
//! The crate is built around three pieces that act in coordination:
//! 1. A [`BrokerSession`], the connection state machine. It connects, opens a
//!    sender link on the configured queue or topic, and drains a bounded work
//!    queue into that link. With automatic reconnection enabled it redials
//!    with exponential backoff when the connection or link drops.
//! 2. A [`ConnectionSupervisor`], which runs sessions on a dedicated thread and
//!    applies the retry policy: retry after a fixed interval, or give up and
//!    raise a fault.
//! 3. The shared [`SessionContext`]: the [`SessionHandle`] used to enqueue
//!    sends, the one-shot [`ReadinessGate`] opened when the first sender link
//!    is usable, and the process wide [`TerminationSignal`].
//!
//! # Examples
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//! use urelay_broker::{
//!     transport::{amqp::AmqpTransport, ConnectionOptions},
//!     BrokerConfig, ConnectionSupervisor, OutboundMessage, SessionContext, Termination,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(BrokerConfig {
//!         address: "127.0.0.1:5672".to_string(),
//!         queue: "topic://telemetry".to_string(),
//!         options: ConnectionOptions::default(),
//!         retry_interval: None,
//!     });
//!     let context = SessionContext::default();
//!
//!     let session_exit =
//!         ConnectionSupervisor::new(config, context.clone(), AmqpTransport::new).spawn()?;
//!
//!     if context.readiness.wait_or_terminated(&context.termination).await {
//!         context
//!             .handle
//!             .enqueue_send(OutboundMessage::new(b"hello".to_vec()).with_quadkeys("1202"));
//!     }
//!     context.termination.raise(Termination::Shutdown);
//!     session_exit.wait(Duration::from_secs(2)).await;
//!     Ok(())
//! }
//! ```

mod message;
mod session;
mod signal;
mod supervisor;
pub mod transport;

use std::time::Duration;

pub use message::{OutboundMessage, QUADKEYS_PROPERTY};
pub use session::{BrokerError, BrokerSession, SessionContext, SessionHandle, SessionState};
pub use signal::{ReadinessGate, Termination, TerminationSignal};
pub use supervisor::{ConnectionSupervisor, SupervisorExit};

use transport::ConnectionOptions;

/// Messages the session work queue holds before new sends are dropped
pub const WORK_QUEUE_DEPTH: usize = 4096;

/// Where and how to reach the broker
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// `host:port` or a full `amqp://` / `amqps://` URL
    pub address: String,
    /// Queue or topic name used as the sender link target
    pub queue: String,
    pub options: ConnectionOptions,
    /// Wait this long before starting a new session after one fails. `None`
    /// turns a failed session into a process fault.
    pub retry_interval: Option<Duration>,
}
