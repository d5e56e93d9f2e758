/// Name of the application property carrying the tile key
pub const QUADKEYS_PROPERTY: &str = "quadkeys";

/// One relayed datagram on its way to the broker. Consumed by the send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub quadkeys: Option<String>,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            quadkeys: None,
        }
    }

    pub fn with_quadkeys(mut self, quadkeys: impl Into<String>) -> Self {
        self.quadkeys = Some(quadkeys.into());
        self
    }
}
