use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use urelay_broker::{
    transport::{ConnectionOptions, SenderLink, Transport, TransportError},
    BrokerConfig, ConnectionSupervisor, OutboundMessage, SessionContext, SupervisorExit,
    Termination,
};
use urelayd::{
    config::RelayConfig,
    relay::{exit_status, relay},
    RelayError,
};

#[derive(Default)]
struct Broker {
    sent: Vec<OutboundMessage>,
    links_closed: usize,
}

#[derive(Clone, Default)]
struct LocalTransport {
    refuse: bool,
    broker: Arc<Mutex<Broker>>,
}

struct LocalLink {
    broker: Arc<Mutex<Broker>>,
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    type Link = LocalLink;

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.refuse {
            return Err(TransportError::Connect("connection refused".into()));
        }
        Ok(())
    }

    async fn open_sender(&mut self, _address: &str) -> Result<LocalLink, TransportError> {
        Ok(LocalLink {
            broker: self.broker.clone(),
        })
    }

    async fn close(&mut self) {}
}

#[async_trait::async_trait]
impl SenderLink for LocalLink {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        self.broker.lock().unwrap().sent.push(message);
        Ok(())
    }

    async fn closed(&mut self) -> TransportError {
        std::future::pending().await
    }

    async fn close(&mut self) {
        self.broker.lock().unwrap().links_closed += 1;
    }
}

fn config(bind: SocketAddr) -> RelayConfig {
    RelayConfig {
        broker: BrokerConfig {
            address: "127.0.0.1:5672".to_string(),
            queue: "telemetry".to_string(),
            options: ConnectionOptions::default(),
            retry_interval: None,
        },
        bind,
        min_msg_size: 0,
        quadkeys: false,
        quadkey_level: 18,
    }
}

fn start_session(
    relay_config: &RelayConfig,
    transport: LocalTransport,
) -> (SessionContext, SupervisorExit) {
    let _ = env_logger::builder().is_test(true).try_init();

    let context = SessionContext::default();
    let exit = ConnectionSupervisor::new(
        Arc::new(relay_config.broker.clone()),
        context.clone(),
        move |_: &BrokerConfig| Ok(transport.clone()),
    )
    .spawn()
    .expect("session thread");
    (context, exit)
}

fn free_port() -> SocketAddr {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind");
    socket.local_addr().expect("local addr")
}

#[tokio::test]
async fn broker_failure_before_ready_is_a_fault() {
    let relay_config = config(free_port());
    let transport = LocalTransport {
        refuse: true,
        ..Default::default()
    };
    let (context, exit) = start_session(&relay_config, transport);

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        relay(relay_config, context.clone()),
    )
    .await
    .expect("relay kept waiting");

    assert!(matches!(outcome, Ok(Termination::Fault)));
    assert_eq!(exit_status(&outcome), 1);
    assert!(!context.readiness.is_ready());
    assert!(exit.wait(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn bind_failure_raises_fault_and_stops_session() {
    let taken = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind");
    let relay_config = config(taken.local_addr().expect("local addr"));
    let transport = LocalTransport::default();
    let (context, exit) = start_session(&relay_config, transport.clone());

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        relay(relay_config, context.clone()),
    )
    .await
    .expect("relay kept waiting");

    assert!(matches!(outcome, Err(RelayError::Io(_))), "{outcome:?}");
    assert_eq!(exit_status(&outcome), 1);
    assert_eq!(context.termination.cause(), Some(Termination::Fault));
    assert!(exit.wait(Duration::from_secs(5)).await);
    assert_eq!(transport.broker.lock().unwrap().links_closed, 1);
    drop(taken);
}

#[tokio::test]
async fn shutdown_relays_then_exits_cleanly() {
    let bind = free_port();
    let relay_config = config(bind);
    let transport = LocalTransport::default();
    let (context, exit) = start_session(&relay_config, transport.clone());

    let task = tokio::spawn(relay(relay_config, context.clone()));

    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    tokio::time::timeout(Duration::from_secs(5), async {
        // the relay binds only after the session is ready
        while transport.broker.lock().unwrap().sent.is_empty() {
            sender.send_to(b"temp=21.5", bind).await.expect("send");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("nothing relayed");

    context.termination.raise(Termination::Shutdown);
    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("relay kept running")
        .expect("relay panicked");

    assert!(matches!(outcome, Ok(Termination::Shutdown)));
    assert_eq!(exit_status(&outcome), 0);
    assert!(exit.wait(Duration::from_secs(5)).await);

    let broker = transport.broker.lock().unwrap();
    assert_eq!(broker.sent[0].payload, b"temp=21.5");
    assert!(broker.sent.iter().all(|m| m.quadkeys.is_none()));
    assert_eq!(broker.links_closed, 1);
}
