//! Runs the full relay pipeline against a transport that only logs what it
//! would send, for exercising the ingest side without a broker. Pair with
//! `udp-sender`.

use clap::Parser;
use std::{net::SocketAddr, sync::Arc};

use urelay_broker::{
    transport::{ConnectionOptions, SenderLink, Transport, TransportError},
    BrokerConfig, ConnectionSupervisor, OutboundMessage, SessionContext,
};
use urelay_quadkey::TileKeyEncoder;
use urelayd::{
    ingest::{DatagramFilter, UdpIngestLoop},
    relay::{shutdown_on_ctrl_c, SHUTDOWN_GRACE},
};

#[derive(Parser, Debug)]
#[command(name = "loopback-relay")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:49900")]
    bind: SocketAddr,

    #[arg(short = 's', long, default_value_t = 0)]
    min_msg_size: usize,

    #[arg(short = 'q', long)]
    enable_quadkeys: bool,

    #[arg(short = 'z', long, default_value_t = 18)]
    quadkey_level: i32,
}

struct LoggingTransport {
    links: usize,
}

struct LoggingLink {
    address: String,
    sent: u64,
}

#[async_trait::async_trait]
impl Transport for LoggingTransport {
    type Link = LoggingLink;

    async fn connect(&mut self) -> Result<(), TransportError> {
        log::info!("Loopback transport connected");
        Ok(())
    }

    async fn open_sender(&mut self, address: &str) -> Result<LoggingLink, TransportError> {
        self.links += 1;
        log::info!("Loopback sender {} opened on {address}", self.links);
        Ok(LoggingLink {
            address: address.to_string(),
            sent: 0,
        })
    }

    async fn close(&mut self) {
        log::info!("Loopback transport closed");
    }
}

#[async_trait::async_trait]
impl SenderLink for LoggingLink {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        self.sent += 1;
        log::info!(
            "[{} #{}] {} bytes quadkeys={:?} payload={}",
            self.address,
            self.sent,
            message.payload.len(),
            message.quadkeys,
            String::from_utf8_lossy(&message.payload)
        );
        Ok(())
    }

    async fn closed(&mut self) -> TransportError {
        // nothing on the other end can detach
        std::future::pending().await
    }

    async fn close(&mut self) {
        log::info!("Loopback sender closed after {} messages", self.sent);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = Arc::new(BrokerConfig {
        address: "loopback:0".to_string(),
        queue: "loopback".to_string(),
        options: ConnectionOptions::default(),
        retry_interval: None,
    });
    let context = SessionContext::default();

    let session_exit = ConnectionSupervisor::new(config, context.clone(), |_: &BrokerConfig| {
        Ok(LoggingTransport { links: 0 })
    })
    .spawn()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let termination = context.termination.clone();
        shutdown_on_ctrl_c(termination.clone());

        if !context.readiness.wait_or_terminated(&termination).await {
            return Ok(());
        }

        let encoder = args
            .enable_quadkeys
            .then(|| TileKeyEncoder::new(args.quadkey_level));
        let ingest = UdpIngestLoop::bind(
            args.bind,
            DatagramFilter::new(args.min_msg_size, encoder),
            context.handle.clone(),
            termination,
        )
        .await?;

        let stats = ingest.run().await;
        session_exit.wait(SHUTDOWN_GRACE).await;
        log::info!("Loopback relay finished: {stats:?}");
        Ok::<_, Box<dyn std::error::Error>>(())
    })
}
