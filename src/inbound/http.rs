//! Plain HTTP bridge
//!
//! Rebuilds the client's request in absolute form, forwards it to an
//! HTTP-capable upstream, and relays the response bytes back. Upstream
//! trouble rotates to another pool entry; a client that stopped
//! listening ends the connection without blaming the upstream.

use super::HandshakeStream;
use crate::common::net::RELAY_CHUNK;
use crate::outbound;
use crate::outbound::http::{proxy_authorization, WRITE_TIMEOUT};
use crate::pool::{self, ProxyPool, Upstream};
use crate::{Error, Result};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Deadline for the first response bytes from the upstream.
const FIRST_READ_TIMEOUT: Duration = Duration::from_secs(15);

enum Forward {
    /// Response relayed to completion.
    Done,
    /// The downstream write failed; the client is gone.
    ClientGone,
}

pub(crate) async fn handle(
    mut stream: HandshakeStream,
    peer_addr: SocketAddr,
    first_line: String,
    pool: &ProxyPool,
) -> Result<()> {
    debug!(
        "Handling HTTP request from {}: {}",
        peer_addr,
        first_line.trim_end()
    );

    // Collect headers as sent, preserving order and spelling.
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut host = String::new();
    loop {
        let mut line = String::new();
        let n = stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::protocol("unexpected EOF in request headers"));
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }

        let Some((name, value)) = trimmed.split_once(':') else {
            continue;
        };
        let name = name.trim().to_string();
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("host") {
            host = value.clone();
        }
        headers.push((name, value));
    }

    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() != 3 {
        stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
        return Err(Error::protocol("malformed HTTP request line"));
    }
    let method = parts[0];
    let target = parts[1];

    if host.is_empty() {
        match host_from_target(target) {
            Some(h) => host = h,
            None => {
                stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
                return Err(Error::protocol("cannot determine target host"));
            }
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
                "HTTP retry {}/{} with upstream {}",
                attempt,
                pool.max_retries(),
                upstream.url
            );
        }

        if !tried.insert(upstream.url.clone()) {
            continue;
        }
        last_upstream = Some(upstream.clone());

        match forward_once(&mut stream, method, target, &host, &headers, &upstream).await {
            Ok(Forward::Done) => {
                pool.mark_success(&upstream);
                return Ok(());
            }
            Ok(Forward::ClientGone) => {
                debug!("Client {} went away mid-response", peer_addr);
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
        "All HTTP upstream attempts failed after {} retries",
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

/// One attempt against one upstream: send the rebuilt request, sniff
/// the response, relay it.
async fn forward_once(
    stream: &mut HandshakeStream,
    method: &str,
    target: &str,
    host: &str,
    headers: &[(String, String)],
    upstream: &Upstream,
) -> Result<Forward> {
    let mut remote = outbound::dial(upstream.host_port()).await?;

    let mut request = format!("{} {} HTTP/1.1\r\n", method, target);
    request.push_str(&format!("Host: {}\r\n", host));

    if let Some(auth) = proxy_authorization(upstream) {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("proxy-authorization") {
            continue;
        }
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("Connection: Keep-Alive\r\n\r\n");

    timeout(WRITE_TIMEOUT, remote.write_all(request.as_bytes()))
        .await
        .map_err(|_| Error::timeout("timed out sending request to upstream"))??;

    let mut buf = vec![0u8; RELAY_CHUNK];
    let n = timeout(FIRST_READ_TIMEOUT, remote.read(&mut buf))
        .await
        .map_err(|_| Error::timeout("timed out waiting for upstream response"))??;
    if n == 0 {
        return Err(Error::connection("upstream closed without responding"));
    }

    // Anything that does not look like an HTTP response means the
    // upstream is not actually proxying for us.
    if !contains_http_marker(&buf[..n]) {
        return Err(Error::protocol("invalid response from upstream"));
    }

    if stream.write_all(&buf[..n]).await.is_err() {
        return Ok(Forward::ClientGone);
    }
    let mut total = n as u64;

    // No deadline past the first chunk; long-poll and streaming
    // responses must keep flowing.
    loop {
        let n = match remote.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!("Error reading from upstream: {}", e);
                break;
            }
        };
        if n == 0 {
            break;
        }
        if stream.write_all(&buf[..n]).await.is_err() {
            return Ok(Forward::ClientGone);
        }
        total += n as u64;
    }

    debug!("HTTP request completed, {} response bytes relayed", total);
    Ok(Forward::Done)
}

fn contains_http_marker(buf: &[u8]) -> bool {
    buf.windows(7).any(|w| w == b"HTTP/1.")
}

/// Pull `host[:port]` out of an absolute-form request target.
fn host_from_target(target: &str) -> Option<String> {
    let rest = match target.split_once("://") {
        Some((_, rest)) => rest,
        None => target,
    };
    let host = rest.split('/').next().unwrap_or("");
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_http_marker() {
        assert!(contains_http_marker(b"HTTP/1.1 200 OK\r\n"));
        assert!(contains_http_marker(b"\r\nHTTP/1.0 404 Not Found"));
        assert!(!contains_http_marker(b"SSH-2.0-OpenSSH_9.0"));
        assert!(!contains_http_marker(b"HTTP/2 200"));
    }

    #[test]
    fn test_host_from_target() {
        assert_eq!(
            host_from_target("http://example.com/index.html").as_deref(),
            Some("example.com")
        );
        assert_eq!(
            host_from_target("http://example.com:8080/").as_deref(),
            Some("example.com:8080")
        );
        assert_eq!(
            host_from_target("example.com/path").as_deref(),
            Some("example.com")
        );
        assert_eq!(host_from_target("/just/a/path"), None);
        assert_eq!(host_from_target("http:///nohost"), None);
    }
}
