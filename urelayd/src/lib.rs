//! UDP ingest front end of the relayer. Receives telemetry datagrams,
//! optionally strips a coordinate header and tags the message with its tile
//! key, then hands everything to the broker session thread.

pub mod config;
pub mod ingest;
pub mod relay;

use thiserror::Error;
use urelay_broker::{transport::TransportError, BrokerError};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Address Parse Error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("Configuration Error: {0}")]
    Config(String),
    #[error("Broker Error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Transport Error: {0}")]
    Transport(#[from] TransportError),
}

pub type RelayResult<T> = Result<T, RelayError>;
