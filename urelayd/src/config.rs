use clap::Parser;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};
use urelay_broker::{
    transport::{ConnectionOptions, IdleTimeout},
    BrokerConfig,
};
use urelay_quadkey::MAX_ZOOM;

use crate::RelayError;

pub const DEFAULT_LISTEN_PORT: u16 = 49900;

/// UDP to AMQP 1.0 telemetry relayer
#[derive(Parser, Debug, Clone)]
#[command(name = "urelayd")]
#[command(about = "Relay UDP telemetry datagrams to an AMQP 1.0 queue or topic")]
#[command(version)]
pub struct Args {
    /// Broker address, `host:port` or an amqp:// / amqps:// URL
    #[arg(short = 'U', long)]
    pub url: String,

    /// Queue or topic name
    #[arg(short = 'Q', long)]
    pub queue: String,

    /// UDP port to listen on
    #[arg(short = 'P', long, default_value_t = DEFAULT_LISTEN_PORT)]
    pub listen_port: u16,

    /// Local address to bind the UDP socket to
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    pub bindto: String,

    /// Discard datagrams smaller than this many bytes
    #[arg(short = 's', long, default_value_t = 0, allow_hyphen_values = true)]
    pub min_msg_size: i64,

    /// Read an 8 byte latitude/longitude header and attach its tile key
    #[arg(short = 'q', long)]
    pub enable_quadkeys: bool,

    /// Tile key zoom level, clamped to 14..=18
    #[arg(short = 'z', long, default_value_t = MAX_ZOOM as i32, allow_hyphen_values = true)]
    pub quadkey_level: i32,

    #[arg(short = 'u', long, default_value = "")]
    pub amqp_username: String,

    #[arg(short = 'p', long, default_value = "")]
    pub amqp_password: String,

    /// Reconnect automatically when the broker connection drops
    #[arg(short = 'r', long)]
    pub amqp_reconnect: bool,

    /// Enable SASL authentication
    #[arg(short = 'S', long)]
    pub amqp_sasl_auth: bool,

    /// Allow the PLAIN mechanism over unencrypted connections
    #[arg(short = 'I', long)]
    pub amqp_plain_auth: bool,

    /// Idle timeout in ms (negative keeps the default, 0 disables it)
    #[arg(short = 't', long, default_value_t = -1, allow_hyphen_values = true)]
    pub amqp_idle_timeout: i64,

    /// Seconds to wait before reconnecting after a failure (0 exits instead)
    #[arg(short = 'R', long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub retry_interval: f64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: tracing::Level,

    /// Write logs to a daily rolling file in this directory instead of stderr
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

/// Validated, immutable relayer settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub bind: SocketAddr,
    pub min_msg_size: usize,
    pub quadkeys: bool,
    pub quadkey_level: i32,
}

impl TryFrom<Args> for RelayConfig {
    type Error = RelayError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let ip: IpAddr = args.bindto.trim().parse().map_err(|e| {
            log::error!("Invalid bind address {}", args.bindto);
            e
        })?;

        let min_msg_size = usize::try_from(args.min_msg_size).map_err(|_| {
            RelayError::Config(format!(
                "Minimum message size must not be negative, got {}",
                args.min_msg_size
            ))
        })?;

        if args.url.trim().is_empty() {
            return Err(RelayError::Config("Broker URL must not be empty".to_string()));
        }
        if args.queue.trim().is_empty() {
            return Err(RelayError::Config(
                "Queue or topic name must not be empty".to_string(),
            ));
        }

        let options = ConnectionOptions {
            sasl_enabled: args.amqp_sasl_auth,
            allow_plain: args.amqp_plain_auth,
            reconnect: args.amqp_reconnect,
            idle_timeout: IdleTimeout::from_millis(args.amqp_idle_timeout),
            ..Default::default()
        }
        .with_credentials(&args.amqp_username, &args.amqp_password);

        Ok(RelayConfig {
            broker: BrokerConfig {
                address: args.url,
                queue: args.queue,
                options,
                retry_interval: retry_interval(args.retry_interval),
            },
            bind: SocketAddr::new(ip, args.listen_port),
            min_msg_size,
            quadkeys: args.enable_quadkeys,
            quadkey_level: args.quadkey_level,
        })
    }
}

fn retry_interval(seconds: f64) -> Option<Duration> {
    if seconds.is_nan() || seconds <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}
