//! Sends test datagrams to a running relayer, optionally prefixed with a
//! coordinate header.
//!
//! ```bash
//! udp-sender --target 127.0.0.1:49900 --lat 46.064742 --lon 11.158636 --payload 'temp=21.5'
//! ```

use clap::Parser;
use std::{net::SocketAddr, time::Duration};
use tokio::net::UdpSocket;

use urelay_quadkey::TileKeyEncoder;
use urelayd::ingest::CoordinateHeader;

#[derive(Parser, Debug)]
#[command(name = "udp-sender")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:49900")]
    target: SocketAddr,

    /// Latitude in degrees, sent as a header together with --lon
    #[arg(long, requires = "lon", allow_hyphen_values = true)]
    lat: Option<f64>,

    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    lon: Option<f64>,

    #[arg(short, long, default_value = "hello from udp-sender")]
    payload: String,

    #[arg(short, long, default_value_t = 1)]
    count: u32,

    /// Delay between datagrams
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut datagram = Vec::new();
    if let (Some(lat), Some(lon)) = (args.lat, args.lon) {
        let header = CoordinateHeader::from_degrees(lat, lon);
        log::info!(
            "Coordinate header {:02x?}, expected tile key {}",
            header.to_bytes(),
            TileKeyEncoder::new(18).encode(header.latitude(), header.longitude())
        );
        datagram.extend_from_slice(&header.to_bytes());
    }
    datagram.extend_from_slice(args.payload.as_bytes());

    let bind: SocketAddr = if args.target.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = UdpSocket::bind(bind).await.map_err(|e| {
        log::error!("Unable to bind sender socket {e:}");
        e
    })?;

    for n in 0..args.count {
        let sent = socket.send_to(&datagram, args.target).await?;
        log::info!("Sent datagram {} ({sent} bytes) to {}", n + 1, args.target);
        if n + 1 < args.count {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    Ok(())
}
