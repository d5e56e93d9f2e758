//! [`Transport`] backed by the `fe2o3-amqp` AMQP 1.0 client

use fe2o3_amqp::{
    connection::ConnectionHandle,
    sasl_profile::SaslProfile,
    session::SessionHandle as AmqpSession,
    types::{
        messaging::{ApplicationProperties, Message},
        primitives::Binary,
    },
    Connection, Sender, Session,
};
use url::Url;

use crate::{
    transport::{broker_url, IdleTimeout, SaslChoice, SenderLink, Transport, TransportError},
    BrokerConfig, OutboundMessage, QUADKEYS_PROPERTY,
};

pub struct AmqpTransport {
    url: Url,
    container_id: String,
    sasl: SaslChoice,
    idle_timeout: IdleTimeout,
    user_defined: bool,
    connection: Option<ConnectionHandle<()>>,
    session: Option<AmqpSession<()>>,
    links: u32,
}

impl AmqpTransport {
    /// Resolve the broker URL and SASL mechanism up front, so a bad address
    /// or credential combination fails before any connection attempt.
    pub fn new(config: &BrokerConfig) -> Result<Self, TransportError> {
        let url = broker_url(&config.address)?;
        let sasl = config.options.sasl_choice(url.scheme() == "amqps")?;

        Ok(Self {
            url,
            container_id: format!("urelay-{}", std::process::id()),
            sasl,
            idle_timeout: config.options.idle_timeout,
            user_defined: !config.options.is_default(),
            connection: None,
            session: None,
            links: 0,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    type Link = AmqpSender;

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.user_defined {
            log::info!("Connecting to the AMQP broker with user-defined connection options.");
        } else {
            log::info!("Connecting to the AMQP broker with default connection options.");
        }

        let mut builder = Connection::builder().container_id(self.container_id.clone());
        match &self.sasl {
            SaslChoice::None => {}
            SaslChoice::Anonymous => builder = builder.sasl_profile(SaslProfile::Anonymous),
            SaslChoice::Plain { username, password } => {
                builder = builder.sasl_profile(SaslProfile::Plain {
                    username: username.clone(),
                    password: password.clone(),
                })
            }
        }
        if let IdleTimeout::Millis(ms) = self.idle_timeout {
            builder = builder.idle_time_out(ms);
        }

        let mut connection = builder
            .open(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.into()))?;

        let session = match Session::begin(&mut connection).await {
            Ok(session) => session,
            Err(e) => {
                if let Err(e) = connection.close().await {
                    log::debug!("Error closing connection after failed session begin: {e}");
                }
                return Err(TransportError::Connect(e.into()));
            }
        };

        self.connection = Some(connection);
        self.session = Some(session);
        Ok(())
    }

    async fn open_sender(&mut self, address: &str) -> Result<AmqpSender, TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
        self.links += 1;
        let name = format!("{}-sender-{}", self.container_id, self.links);

        let sender = Sender::attach(session, name, address)
            .await
            .map_err(|e| TransportError::Attach(e.into()))?;

        Ok(AmqpSender {
            sender: Some(sender),
        })
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.end().await {
                log::debug!("Error ending AMQP session: {e}");
            }
        }
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                log::debug!("Error closing AMQP connection: {e}");
            }
        }
    }
}

pub struct AmqpSender {
    sender: Option<Sender>,
}

#[async_trait::async_trait]
impl SenderLink for AmqpSender {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        let sender = self.sender.as_mut().ok_or(TransportError::Closed)?;

        let mut builder = Message::builder().data(Binary::from(message.payload));
        if let Some(quadkeys) = message.quadkeys {
            builder = builder.application_properties(
                ApplicationProperties::builder()
                    .insert(QUADKEYS_PROPERTY, quadkeys)
                    .build(),
            );
        }

        // settlement is not awaited, the delivery future is dropped
        let _ = sender
            .send_batchable(builder.build())
            .await
            .map_err(|e| TransportError::Send(e.into()))?;
        Ok(())
    }

    async fn closed(&mut self) -> TransportError {
        let Some(sender) = self.sender.as_mut() else {
            return TransportError::Closed;
        };
        // also fires when the session or connection under the link goes away
        let e = sender.on_detach().await;
        self.sender = None;
        TransportError::Detached(e.into())
    }

    async fn close(&mut self) {
        if let Some(sender) = self.sender.take() {
            if let Err(e) = sender.close().await {
                log::debug!("Error detaching sender link: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectionOptions;

    fn config(address: &str, options: ConnectionOptions) -> BrokerConfig {
        BrokerConfig {
            address: address.to_string(),
            queue: "telemetry".to_string(),
            options,
            retry_interval: None,
        }
    }

    #[test]
    fn new_resolves_url_and_mechanism() {
        let transport = AmqpTransport::new(&config(
            "broker.local:5672",
            ConnectionOptions {
                allow_plain: true,
                ..Default::default()
            }
            .with_credentials("relay", "pw"),
        ))
        .expect("valid config");

        assert_eq!(transport.url().as_str(), "amqp://broker.local:5672");
        assert!(matches!(transport.sasl, SaslChoice::Plain { .. }));
        assert!(transport.user_defined);
    }

    #[test]
    fn new_rejects_plain_over_cleartext() {
        let options = ConnectionOptions::default().with_credentials("relay", "pw");
        assert!(matches!(
            AmqpTransport::new(&config("broker.local:5672", options.clone())),
            Err(TransportError::Config(_))
        ));
        assert!(AmqpTransport::new(&config("amqps://broker.local:5671", options)).is_ok());
    }

    #[tokio::test]
    async fn sender_requires_connection() {
        let mut transport =
            AmqpTransport::new(&config("127.0.0.1:5672", ConnectionOptions::default()))
                .expect("valid config");
        assert!(matches!(
            transport.open_sender("telemetry").await,
            Err(TransportError::NotConnected)
        ));
        // closing an unconnected transport is a no-op
        transport.close().await;
    }

    #[tokio::test]
    async fn closed_sender_rejects_sends() {
        let mut link = AmqpSender { sender: None };
        assert!(matches!(
            link.send(OutboundMessage::new(b"x".to_vec())).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(link.closed().await, TransportError::Closed));
    }
}
