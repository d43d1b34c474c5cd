//! SOCKS5 upstream client (proxy chaining)
//!
//! Speaks RFC 1928 toward an upstream SOCKS5 proxy, with RFC 1929
//! username/password sub-negotiation when the upstream entry carries
//! credentials. The client's original address bytes are re-emitted
//! verbatim in the chained request.

use super::dial;
use crate::common::socks::{
    reply_error_message, RawAddress, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, AUTH_NO_AUTH,
    AUTH_USERNAME_PASSWORD, CMD_CONNECT, REP_GENERAL_FAILURE, REP_SUCCEEDED, SOCKS5_VERSION,
};
use crate::pool::Upstream;
use crate::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Deadline for each handshake exchange with the upstream.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A chaining failure, carrying the SOCKS5 reply code to send back to
/// the downstream client.
#[derive(Debug)]
pub struct ChainError {
    pub reply: u8,
    pub error: Error,
}

impl ChainError {
    fn general(error: Error) -> Self {
        ChainError {
            reply: REP_GENERAL_FAILURE,
            error,
        }
    }
}

/// Dial the upstream and run the full greeting/auth/request exchange
/// for `address`. On success the stream is a transparent tunnel to the
/// target.
pub async fn connect_via(
    upstream: &Upstream,
    address: &RawAddress,
) -> std::result::Result<TcpStream, ChainError> {
    let mut stream = dial(upstream.host_port()).await.map_err(ChainError::general)?;

    // Greeting: advertise user/pass only when we can actually answer it.
    let greeting: &[u8] = if upstream.has_credentials() {
        &[SOCKS5_VERSION, 2, AUTH_NO_AUTH, AUTH_USERNAME_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_NO_AUTH]
    };
    write_with_deadline(&mut stream, greeting)
        .await
        .map_err(ChainError::general)?;

    let mut choice = [0u8; 2];
    read_with_deadline(&mut stream, &mut choice)
        .await
        .map_err(ChainError::general)?;

    if choice[0] != SOCKS5_VERSION {
        return Err(ChainError::general(Error::protocol(format!(
            "invalid SOCKS version from upstream: {}",
            choice[0]
        ))));
    }

    match choice[1] {
        AUTH_NO_AUTH => {}
        AUTH_USERNAME_PASSWORD if upstream.has_credentials() => {
            debug!("Upstream {} requires username/password", upstream.url);
            authenticate(&mut stream, upstream)
                .await
                .map_err(ChainError::general)?;
        }
        method => {
            return Err(ChainError::general(Error::auth(format!(
                "upstream selected unsupported auth method: {}",
                method
            ))));
        }
    }

    // Request: VER CMD RSV followed by the client's address bytes.
    let mut request = Vec::with_capacity(3 + address.len());
    request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00]);
    address.append_to(&mut request);
    write_with_deadline(&mut stream, &request)
        .await
        .map_err(ChainError::general)?;

    let mut reply = [0u8; 4];
    read_with_deadline(&mut stream, &mut reply)
        .await
        .map_err(ChainError::general)?;

    if reply[0] != SOCKS5_VERSION {
        return Err(ChainError::general(Error::protocol(format!(
            "invalid SOCKS version in upstream reply: {}",
            reply[0]
        ))));
    }

    if reply[1] != REP_SUCCEEDED {
        return Err(ChainError {
            reply: reply[1],
            error: Error::connection(format!(
                "upstream refused connection: {}",
                reply_error_message(reply[1])
            )),
        });
    }

    skip_bound_address(&mut stream, reply[3])
        .await
        .map_err(ChainError::general)?;

    debug!(
        "SOCKS5 chained via {} to {}",
        upstream.url,
        address.to_target()
    );
    Ok(stream)
}

/// RFC 1929 username/password sub-negotiation.
async fn authenticate(stream: &mut TcpStream, upstream: &Upstream) -> Result<()> {
    let (username, password) = upstream
        .credentials()
        .ok_or_else(|| Error::auth("upstream requires credentials but none are configured"))?;

    if username.len() > 255 || password.len() > 255 {
        return Err(Error::auth("username or password too long"));
    }

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(0x01);
    request.push(username.len() as u8);
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());

    write_with_deadline(stream, &request).await?;

    let mut response = [0u8; 2];
    read_with_deadline(stream, &mut response).await?;

    if response[0] != 0x01 || response[1] != 0x00 {
        return Err(Error::auth("upstream rejected credentials"));
    }

    debug!("Authenticated against upstream {}", upstream.url);
    Ok(())
}

/// Consume the BND.ADDR / BND.PORT tail of a reply.
async fn skip_bound_address(stream: &mut TcpStream, atyp: u8) -> Result<()> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4 + 2];
            read_with_deadline(stream, &mut buf).await?;
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16 + 2];
            read_with_deadline(stream, &mut buf).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_with_deadline(stream, &mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            read_with_deadline(stream, &mut buf).await?;
        }
        t => {
            return Err(Error::protocol(format!(
                "invalid address type in upstream reply: {}",
                t
            )));
        }
    }
    Ok(())
}

async fn write_with_deadline(stream: &mut TcpStream, data: &[u8]) -> Result<()> {
    timeout(HANDSHAKE_TIMEOUT, stream.write_all(data))
        .await
        .map_err(|_| Error::timeout("timed out writing to upstream"))??;
    Ok(())
}

async fn read_with_deadline(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(buf))
        .await
        .map_err(|_| Error::timeout("timed out reading from upstream"))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_connect_via_no_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            assert_eq!(read_exactly(&mut stream, 3).await, vec![0x05, 1, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            // VER CMD RSV ATYP + IPv4 + port
            let request = read_exactly(&mut stream, 10).await;
            assert_eq!(
                request,
                vec![0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50]
            );
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let upstream = Upstream::new(format!("socks5://{}", addr), None, None);
        let wire: Vec<u8> = vec![1, 2, 3, 4, 0x00, 0x50];
        let address = RawAddress::read_from(&mut wire.as_slice(), ATYP_IPV4)
            .await
            .unwrap();

        connect_via(&upstream, &address).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_via_username_password() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            assert_eq!(
                read_exactly(&mut stream, 4).await,
                vec![0x05, 2, 0x00, 0x02]
            );
            stream.write_all(&[0x05, 0x02]).await.unwrap();

            // 01 | ulen | "user" | plen | "pw"
            let auth = read_exactly(&mut stream, 9).await;
            assert_eq!(auth, b"\x01\x04user\x02pw");
            stream.write_all(&[0x01, 0x00]).await.unwrap();

            let mut expected = vec![0x05, 0x01, 0x00, 0x03, 11];
            expected.extend_from_slice(b"example.com");
            expected.extend_from_slice(&[0x01, 0xBB]);
            assert_eq!(read_exactly(&mut stream, expected.len()).await, expected);

            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let upstream = Upstream::new(
            format!("socks5://{}", addr),
            Some("user".to_string()),
            Some("pw".to_string()),
        );
        let mut wire: Vec<u8> = vec![11];
        wire.extend_from_slice(b"example.com");
        wire.extend_from_slice(&443u16.to_be_bytes());
        let address = RawAddress::read_from(&mut wire.as_slice(), ATYP_DOMAIN)
            .await
            .unwrap();

        connect_via(&upstream, &address).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_via_forwards_upstream_reply_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_exactly(&mut stream, 3).await;
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            let _ = read_exactly(&mut stream, 10).await;
            // Host unreachable
            stream
                .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let upstream = Upstream::new(format!("socks5://{}", addr), None, None);
        let wire: Vec<u8> = vec![1, 2, 3, 4, 0x00, 0x50];
        let address = RawAddress::read_from(&mut wire.as_slice(), ATYP_IPV4)
            .await
            .unwrap();

        let err = connect_via(&upstream, &address).await.unwrap_err();
        assert_eq!(err.reply, 0x04);
    }
}
