//! HTTPS (CONNECT) bridge
//!
//! Establishes a CONNECT tunnel through an HTTP-capable upstream and
//! then relays bytes opaquely in both directions.

use super::HandshakeStream;
use crate::common::net::copy_bidirectional;
use crate::outbound;
use crate::pool::{self, ProxyPool, Upstream};
use crate::{Error, Result};
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{debug, error, info};

pub(crate) async fn handle(
    mut stream: HandshakeStream,
    peer_addr: SocketAddr,
    first_line: String,
    pool: &ProxyPool,
) -> Result<()> {
    debug!(
        "Handling CONNECT request from {}: {}",
        peer_addr,
        first_line.trim_end()
    );

    // CONNECT example.com:443 HTTP/1.1
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() != 3 {
        stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
        return Err(Error::protocol("malformed CONNECT request line"));
    }
    let host_port = parts[1].to_string();

    // Drain the client's request headers; the tunnel does not use them.
    loop {
        let mut line = String::new();
        let n = stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::protocol("unexpected EOF in request headers"));
        }
        if line.trim().is_empty() {
            break;
        }
    }

    let mut tried: HashSet<String> = HashSet::new();
    let mut last_error: Option<Error> = None;
    let mut last_upstream: Option<Upstream> = None;

    for attempt in 0..=pool.max_retries() {
        let upstream = if attempt == 0 {
            pool.select_random(pool::http_filter)
        } else {
            let exclude = last_upstream.as_ref().map(|u| u.url.as_str());
            pool.select_next(exclude, pool::http_filter)
        };

        let Some(upstream) = upstream else {
            error!(
                "No more available HTTP upstreams to try after {} attempts",
                attempt
            );
            let _ = stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
            return Ok(());
        };

        if attempt > 0 {
            info!(
                "CONNECT retry {}/{} with upstream {}",
                attempt,
                pool.max_retries(),
                upstream.url
            );
        }

        if !tried.insert(upstream.url.clone()) {
            continue;
        }
        last_upstream = Some(upstream.clone());

        match outbound::http::connect_handshake(&upstream, &host_port).await {
            Ok(remote) => {
                pool.mark_success(&upstream);

                if stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                    .is_err()
                {
                    debug!("Client {} went away before tunnel start", peer_addr);
                    return Ok(());
                }

                info!(
                    "HTTPS tunnel established via {} to {}",
                    upstream.url, host_port
                );

                let client = stream.into_prefixed();
                let (sent, received) = copy_bidirectional(client, remote).await;
                debug!(
                    "CONNECT {} -> {} done (sent: {}, recv: {})",
                    peer_addr, host_port, sent, received
                );
                return Ok(());
            }
            Err(e) => {
                debug!("Upstream {} failed: {}", upstream.url, e);
                pool.mark_failed(&upstream);
                last_error = Some(e);
            }
        }
    }

    error!(
        "All CONNECT upstream attempts failed after {} retries",
        pool.max_retries()
    );
    let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
    let response = format!(
        "HTTP/1.1 502 Bad Gateway\r\n\r\nAll proxy attempts failed: {}\r\n",
        reason
    );
    let _ = stream.write_all(response.as_bytes()).await;
    Ok(())
}
