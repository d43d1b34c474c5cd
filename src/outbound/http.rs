//! HTTP upstream client
//!
//! Implements the CONNECT handshake toward an HTTP proxy and the
//! `Proxy-Authorization` header shared by both HTTP-flavored bridges.

use super::dial;
use crate::common::net::PrefixedStream;
use crate::pool::Upstream;
use crate::{Error, Result};
use base64::Engine;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::debug;

/// Deadline for writing handshake bytes to the upstream.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the CONNECT status line and header drain.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the `Proxy-Authorization` value when the upstream carries
/// credentials.
pub fn proxy_authorization(upstream: &Upstream) -> Option<String> {
    upstream.credentials().map(|(user, pass)| {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        format!("Basic {}", encoded)
    })
}

/// Dial the upstream and tunnel to `target` (`host:port`) via CONNECT.
/// On success the returned stream is positioned at the start of the
/// tunneled byte stream.
pub async fn connect_handshake(upstream: &Upstream, target: &str) -> Result<PrefixedStream> {
    let stream = dial(upstream.host_port()).await?;
    let mut reader = BufReader::new(stream);

    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if let Some(auth) = proxy_authorization(upstream) {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");

    debug!("Sending CONNECT {} via {}", target, upstream.url);

    timeout(WRITE_TIMEOUT, reader.get_mut().write_all(request.as_bytes()))
        .await
        .map_err(|_| Error::timeout("timed out sending CONNECT to upstream"))??;

    let mut status_line = String::new();
    let n = timeout(RESPONSE_TIMEOUT, reader.read_line(&mut status_line))
        .await
        .map_err(|_| Error::timeout("timed out waiting for CONNECT response"))??;
    if n == 0 {
        return Err(Error::connection("upstream closed during CONNECT"));
    }

    if !status_line.contains("200") {
        return Err(Error::connection(format!(
            "upstream refused CONNECT: {}",
            status_line.trim()
        )));
    }

    // Drain response headers up to the blank line.
    loop {
        let mut line = String::new();
        let n = timeout(RESPONSE_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| Error::timeout("timed out reading CONNECT response headers"))??;
        if n == 0 {
            return Err(Error::connection("upstream closed during CONNECT"));
        }
        if line.trim().is_empty() {
            break;
        }
    }

    Ok(PrefixedStream::from_buf_reader(reader))
}
