//! Demo: relay a datagram to a UDP echo peer through a TURN server.
//!
//! Run `turn-client peer` on the peer host to start the echo server, then
//! `turn-client -u user -p secret --server turn.example.org:3478` to
//! allocate a relay, send `hello world!` to the peer and print the echo.

use std::net::SocketAddr;
use std::process;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{lookup_host, UdpSocket};
use tracing::info;
use turn_client::{Client, Options};

#[derive(Parser, Debug)]
#[command(name = "turn-client")]
struct Opt {
    /// TURN server address
    #[arg(long, default_value = "localhost:3478")]
    server: String,
    /// Peer address
    #[arg(long, default_value = "localhost:56780")]
    peer: String,
    /// Username for long-term credentials
    #[arg(short = 'u', default_value = "user")]
    username: String,
    /// Password for long-term credentials
    #[arg(short = 'p', default_value = "secret")]
    password: String,
    /// Pass `peer` to run the UDP echo peer instead of the TURN client
    mode: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let opt = Opt::parse();

    if opt.mode.as_deref() == Some("peer") {
        return echo_peer(&opt.peer).await;
    }
    if opt.password.is_empty() {
        eprintln!("No password set, auth is required.");
        process::exit(2);
    }

    let server = resolve(&opt.server).await?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server).await?;
    info!(local = %socket.local_addr()?, %server, "dialed server");

    let client = Client::new(
        socket,
        Options {
            username: opt.username,
            password: opt.password,
            ..Options::default()
        },
    )?;
    let allocation = client.allocate().await?;
    info!(relayed = %allocation.relayed(), "allocated");

    let peer = resolve(&opt.peer).await?;
    let permission = allocation.create(peer.ip()).await?;
    let conn = permission.create_udp(peer)?;

    conn.write(b"hello world!").await?;
    conn.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)));
    let mut buf = [0u8; 1500];
    let n = conn.read(&mut buf).await?;
    info!("got message: {}", String::from_utf8_lossy(&buf[..n]));

    allocation.close().await;
    client.close().await;
    Ok(())
}

/// Echoes every datagram back to its sender on the peer port.
async fn echo_peer(addr: &str) -> Result<()> {
    let port = addr.rsplit(':').next().context("peer address has no port")?;
    let socket = UdpSocket::bind(format!("0.0.0.0:{port}")).await?;
    info!(local = %socket.local_addr()?, "listening as echo server");
    let mut buf = [0u8; 1024];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        info!(%from, "got message: {}", String::from_utf8_lossy(&buf[..n]));
        socket.send_to(&buf[..n], from).await?;
        info!(%from, "echoed back");
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    lookup_host(addr)
        .await?
        .next()
        .with_context(|| format!("could not resolve {addr}"))
}
