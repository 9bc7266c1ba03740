//! TCP client and daemon for the vaultsync protocol.

pub mod client;
#[cfg(feature = "server")]
pub mod server;

use crate::protocol::timeouts::CONNECT_MS;
use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

/// Open a TCP stream with the connect timeout and Nagle disabled.
pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    let stream = match timeout(Duration::from_millis(CONNECT_MS), TcpStream::connect(&addr)).await {
        Ok(res) => res.with_context(|| format!("connect {}", addr))?,
        Err(_) => anyhow::bail!("connect {} timed out after {} ms", addr, CONNECT_MS),
    };
    let _ = stream.set_nodelay(true);
    Ok(stream)
}
