//! Messaging transport seam. [`BrokerSession`](crate::BrokerSession) only
//! talks to the broker through [`Transport`] and [`SenderLink`], so the
//! connection state machine can run against the AMQP 1.0 client in
//! [`amqp`] or against an in-memory transport in tests.

pub mod amqp;
#[cfg(test)]
pub(crate) mod scripted;

use thiserror::Error;
use url::Url;

use crate::OutboundMessage;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connect Error: {0}")]
    Connect(#[source] BoxError),
    #[error("Sender attach Error: {0}")]
    Attach(#[source] BoxError),
    #[error("Send Error: {0}")]
    Send(#[source] BoxError),
    #[error("Not connected")]
    NotConnected,
    #[error("Link closed")]
    Closed,
    #[error("Link detached by peer: {0}")]
    Detached(#[source] BoxError),
    #[error("Configuration Error: {0}")]
    Config(String),
}

/// A connection to the broker able to open sender links. All calls happen on
/// the session thread.
#[async_trait::async_trait]
pub trait Transport: Send {
    type Link: SenderLink;

    /// Establish the connection (including authentication)
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Open a sender link bound to a queue or topic address
    async fn open_sender(&mut self, address: &str) -> Result<Self::Link, TransportError>;

    /// Tear the connection down. Errors are logged, not returned.
    async fn close(&mut self);
}

/// An open sender link
#[async_trait::async_trait]
pub trait SenderLink: Send {
    /// Hand one message to the link. The delivery outcome is not awaited.
    async fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Resolves with the cause once the peer or the connection ends the
    /// link. Pending forever while the link is healthy; must be cancel safe.
    async fn closed(&mut self) -> TransportError;

    async fn close(&mut self);
}

/// Idle timeout advertised to the broker at connect time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleTimeout {
    /// Leave the transport default in place
    #[default]
    Default,
    /// No idle timeout
    Forever,
    Millis(u32),
}

impl IdleTimeout {
    /// Command line convention: negative keeps the default, 0 is forever,
    /// anything else is milliseconds
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            m if m < 0 => IdleTimeout::Default,
            0 => IdleTimeout::Forever,
            m => IdleTimeout::Millis(u32::try_from(m).unwrap_or(u32::MAX)),
        }
    }
}

/// Authentication and connection behaviour requested by the operator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    pub sasl_enabled: bool,
    /// Allow the PLAIN mechanism over an unencrypted connection
    pub allow_plain: bool,
    /// Redial with backoff instead of failing the session on connection loss
    pub reconnect: bool,
    pub idle_timeout: IdleTimeout,
}

/// SASL layer resolved from [`ConnectionOptions`] for a given URL scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslChoice {
    None,
    Anonymous,
    Plain { username: String, password: String },
}

impl ConnectionOptions {
    /// Builder for credentials. Empty strings count as unset.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = (!username.is_empty()).then(|| username.to_string());
        self.password = (!password.is_empty()).then(|| password.to_string());
        self
    }

    /// True when nothing differs from the transport defaults
    pub fn is_default(&self) -> bool {
        *self == ConnectionOptions::default()
    }

    pub fn sasl_choice(&self, encrypted: bool) -> Result<SaslChoice, TransportError> {
        match &self.username {
            Some(username) => {
                if !encrypted && !self.allow_plain {
                    return Err(TransportError::Config(
                        "username given but the PLAIN mechanism is not allowed over an \
                        unencrypted connection, enable plain authentication or use amqps"
                            .to_string(),
                    ));
                }
                Ok(SaslChoice::Plain {
                    username: username.clone(),
                    password: self.password.clone().unwrap_or_default(),
                })
            }
            None if self.sasl_enabled => Ok(SaslChoice::Anonymous),
            None => Ok(SaslChoice::None),
        }
    }

    pub fn log_summary(&self) {
        if let Some(username) = &self.username {
            log::info!("AMQP username successfully set: {username}");
        }
        if self.password.is_some() {
            log::info!("AMQP password successfully set.");
        }
        if self.reconnect {
            log::info!("AMQP automatic reconnection enabled.");
        }
        if self.sasl_enabled {
            log::info!("AMQP SASL authentication enabled.");
        }
        if self.allow_plain {
            log::info!("AMQP Plain authentication enabled.");
        }
        match self.idle_timeout {
            IdleTimeout::Default => log::info!("No idle timeout has been explicitly set."),
            IdleTimeout::Forever => log::info!("Idle timeout set to FOREVER."),
            IdleTimeout::Millis(ms) => log::info!("Idle timeout set to {ms} ms."),
        }
    }
}

/// Normalise a broker address to an AMQP URL. A bare `host:port` gets the
/// `amqp://` scheme.
pub fn broker_url(address: &str) -> Result<Url, TransportError> {
    let address = address.trim();
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("amqp://{address}")
    };

    let url = Url::parse(&candidate)
        .map_err(|e| TransportError::Config(format!("Invalid broker address {address}: {e}")))?;

    match url.scheme() {
        "amqp" | "amqps" => {}
        other => {
            return Err(TransportError::Config(format!(
                "Unsupported broker URL scheme {other}"
            )))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(TransportError::Config(format!(
            "Broker address {address} has no host"
        )));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_from_command_line_value() {
        assert_eq!(IdleTimeout::from_millis(-1), IdleTimeout::Default);
        assert_eq!(IdleTimeout::from_millis(0), IdleTimeout::Forever);
        assert_eq!(IdleTimeout::from_millis(1500), IdleTimeout::Millis(1500));
        assert_eq!(
            IdleTimeout::from_millis(i64::MAX),
            IdleTimeout::Millis(u32::MAX)
        );
    }

    #[test]
    fn bare_address_gets_amqp_scheme() {
        let url = broker_url("127.0.0.1:5672").expect("valid address");
        assert_eq!(url.scheme(), "amqp");
        assert_eq!(url.host_str(), Some("127.0.0.1"));
        assert_eq!(url.port(), Some(5672));

        let url = broker_url("amqps://broker.example.org:5671").expect("valid address");
        assert_eq!(url.scheme(), "amqps");
    }

    #[test]
    fn bad_addresses_are_config_errors() {
        for address in ["http://localhost:5672", "amqp://", "amqp://host:notaport"] {
            assert!(
                matches!(broker_url(address), Err(TransportError::Config(_))),
                "{address} accepted"
            );
        }
    }

    #[test]
    fn password_lands_in_the_password_field() {
        let options = ConnectionOptions {
            allow_plain: true,
            ..Default::default()
        }
        .with_credentials("relay", "s3cret");

        assert_eq!(options.username.as_deref(), Some("relay"));
        assert_eq!(options.password.as_deref(), Some("s3cret"));
        assert_eq!(
            options.sasl_choice(false).expect("plain allowed"),
            SaslChoice::Plain {
                username: "relay".to_string(),
                password: "s3cret".to_string()
            }
        );
    }

    #[test]
    fn empty_credentials_are_unset() {
        let options = ConnectionOptions::default().with_credentials("", "");
        assert!(options.is_default());
        assert_eq!(options.sasl_choice(false).expect("no sasl"), SaslChoice::None);
    }

    #[test]
    fn plain_over_cleartext_needs_opt_in() {
        let options = ConnectionOptions::default().with_credentials("relay", "pw");
        assert!(matches!(
            options.sasl_choice(false),
            Err(TransportError::Config(_))
        ));
        assert!(matches!(
            options.sasl_choice(true),
            Ok(SaslChoice::Plain { .. })
        ));
    }

    #[test]
    fn sasl_without_credentials_is_anonymous() {
        let options = ConnectionOptions {
            sasl_enabled: true,
            ..Default::default()
        };
        assert_eq!(
            options.sasl_choice(false).expect("anonymous"),
            SaslChoice::Anonymous
        );
        assert!(!options.is_default());
    }
}
