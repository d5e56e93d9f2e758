use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;

use urelay_broker::{OutboundMessage, SessionHandle, TerminationSignal};
use urelay_quadkey::TileKeyEncoder;

use crate::{config::RelayConfig, RelayResult};

/// Receive buffer size, kept below the usual path MTU
pub const MAX_DATAGRAM_SIZE: usize = 1460;

/// Latitude/longitude prefix carried by datagrams when tile keys are enabled.
/// Both fields are degrees scaled by 1e7, big endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinateHeader {
    pub latitude_e7: i32,
    pub longitude_e7: i32,
}

impl CoordinateHeader {
    pub const LEN: usize = 8;
    const SCALE: f64 = 1e7;

    pub fn from_degrees(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude_e7: (latitude * Self::SCALE).round() as i32,
            longitude_e7: (longitude * Self::SCALE).round() as i32,
        }
    }

    /// Split a datagram into its header and the remaining payload. `None` if
    /// the datagram is too short to hold a header.
    pub fn split(datagram: &[u8]) -> Option<(Self, &[u8])> {
        let (header, payload) = datagram.split_first_chunk::<{ Self::LEN }>()?;
        let (latitude, longitude) = header.split_at(4);

        let header = Self {
            latitude_e7: i32::from_be_bytes(latitude.try_into().ok()?),
            longitude_e7: i32::from_be_bytes(longitude.try_into().ok()?),
        };
        Some((header, payload))
    }

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[..4].copy_from_slice(&self.latitude_e7.to_be_bytes());
        bytes[4..].copy_from_slice(&self.longitude_e7.to_be_bytes());
        bytes
    }

    pub fn latitude(&self) -> f64 {
        self.latitude_e7 as f64 / Self::SCALE
    }

    pub fn longitude(&self) -> f64 {
        self.longitude_e7 as f64 / Self::SCALE
    }
}

/// Where relayed messages go. Implemented by the broker [`SessionHandle`];
/// must never block the ingest loop.
pub trait MessageSink {
    /// Returns `false` if the message was dropped
    fn enqueue_send(&self, message: OutboundMessage) -> bool;
}

impl MessageSink for SessionHandle {
    fn enqueue_send(&self, message: OutboundMessage) -> bool {
        SessionHandle::enqueue_send(self, message)
    }
}

/// Turns raw datagrams into outbound messages
#[derive(Debug, Clone)]
pub struct DatagramFilter {
    min_size: usize,
    encoder: Option<TileKeyEncoder>,
}

impl DatagramFilter {
    pub fn new(min_size: usize, encoder: Option<TileKeyEncoder>) -> Self {
        Self { min_size, encoder }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        let encoder = config
            .quadkeys
            .then(|| TileKeyEncoder::new(config.quadkey_level));
        Self::new(config.min_msg_size, encoder)
    }

    /// `None` means the datagram is dropped
    pub fn process(&self, datagram: &[u8]) -> Option<OutboundMessage> {
        if datagram.len() < self.min_size {
            log::trace!(
                "Dropping {} byte datagram, below minimum of {}",
                datagram.len(),
                self.min_size
            );
            return None;
        }

        let Some(encoder) = &self.encoder else {
            return Some(OutboundMessage::new(datagram));
        };

        let Some((header, payload)) = CoordinateHeader::split(datagram) else {
            log::debug!(
                "Dropping {} byte datagram, too short for a coordinate header",
                datagram.len()
            );
            return None;
        };

        let quadkeys = encoder.encode(header.latitude(), header.longitude());
        log::trace!(
            "Coordinates {}, {} -> {quadkeys}",
            header.latitude(),
            header.longitude()
        );
        Some(OutboundMessage::new(payload).with_quadkeys(quadkeys))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub relayed: u64,
    pub filtered: u64,
    /// Handed to the sink but dropped there (no ready session, full queue)
    pub not_ready: u64,
    pub recv_errors: u64,
}

/// Receive loop of the relayer. Waits on the socket and the termination
/// signal at the same time; only the latter ends the loop.
pub struct UdpIngestLoop<S> {
    socket: UdpSocket,
    filter: DatagramFilter,
    sink: S,
    termination: Arc<TerminationSignal>,
}

impl<S: MessageSink> UdpIngestLoop<S> {
    pub async fn bind(
        addr: SocketAddr,
        filter: DatagramFilter,
        sink: S,
        termination: Arc<TerminationSignal>,
    ) -> RelayResult<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            log::error!("Unable to bind to socket {addr}: {e}");
            e
        })?;
        Ok(Self::new(socket, filter, sink, termination))
    }

    pub fn new(
        socket: UdpSocket,
        filter: DatagramFilter,
        sink: S,
        termination: Arc<TerminationSignal>,
    ) -> Self {
        Self {
            socket,
            filter,
            sink,
            termination,
        }
    }

    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs until termination is raised, then releases the socket
    pub async fn run(self) -> IngestStats {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        let mut stats = IngestStats::default();

        if let Ok(addr) = self.socket.local_addr() {
            log::info!("Listening for datagrams on {addr}");
        }

        loop {
            tokio::select! {
                biased;
                cause = self.termination.raised() => {
                    log::info!("Ingest loop stopping ({cause:?})");
                    break;
                }
                res = self.socket.recv_from(&mut buffer) => {
                    match res {
                        Ok((len, from)) => {
                            stats.received += 1;
                            log::trace!("Received {len} bytes from {from}");
                            match self.filter.process(&buffer[..len]) {
                                Some(message) => {
                                    if self.sink.enqueue_send(message) {
                                        stats.relayed += 1;
                                    } else {
                                        stats.not_ready += 1;
                                    }
                                }
                                None => stats.filtered += 1,
                            }
                        }
                        Err(e) => {
                            stats.recv_errors += 1;
                            log::error!("Socket receive error: {e}");
                        }
                    }
                }
            }
        }

        drop(self.socket);
        log::info!(
            "Ingest loop done: {} received, {} relayed, {} filtered, {} dropped, {} receive errors",
            stats.received,
            stats.relayed,
            stats.filtered,
            stats.not_ready,
            stats.recv_errors
        );
        stats
    }
}
