//! Upstream-facing clients (dialing and proxy handshakes)

pub mod http;
pub mod socks5;

use crate::common::net::configure_tcp_stream;
use crate::{Error, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// TCP dial timeout for upstreams and direct targets alike.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial `host:port` with the standard timeout and socket tuning.
pub async fn dial(addr: &str) -> Result<TcpStream> {
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::timeout(format!("timed out connecting to {}", addr)))?
        .map_err(|e| Error::connection(format!("failed to connect to {}: {}", addr, e)))?;

    configure_tcp_stream(&stream);
    Ok(stream)
}
