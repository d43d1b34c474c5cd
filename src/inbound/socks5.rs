//! SOCKS5 bridge
//!
//! Speaks RFC 1928 toward the downstream client (no-auth only) and
//! chains the CONNECT through a SOCKS5 upstream when one is available,
//! falling back to a direct dial otherwise.

use super::HandshakeStream;
use crate::common::net::copy_bidirectional;
use crate::common::socks::{
    RawAddress, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, AUTH_NO_ACCEPTABLE, AUTH_NO_AUTH, CMD_CONNECT,
    REP_ADDRESS_TYPE_NOT_SUPPORTED, REP_COMMAND_NOT_SUPPORTED, REP_GENERAL_FAILURE,
    REP_HOST_UNREACHABLE, REP_SUCCEEDED, SOCKS5_VERSION,
};
use crate::outbound;
use crate::pool::{self, ProxyPool};
use crate::{Error, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

pub(crate) async fn handle(
    mut stream: HandshakeStream,
    peer_addr: SocketAddr,
    pool: &ProxyPool,
) -> Result<()> {
    debug!("Handling SOCKS5 request from {}", peer_addr);

    // Greeting: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        stream
            .write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(Error::protocol(format!(
            "unsupported SOCKS version: {}",
            head[0]
        )));
    }

    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    debug!(
        "Available SOCKS5 upstreams: {}",
        pool.working_count(pool::socks5_filter)
    );

    // The offered method list is ignored; no authentication is asked
    // of the downstream client.
    stream.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Error::protocol(format!(
            "unsupported SOCKS version in request: {}",
            header[0]
        )));
    }
    if header[1] != CMD_CONNECT {
        send_reply(&mut stream, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(Error::protocol(format!(
            "unsupported SOCKS5 command: {}",
            header[1]
        )));
    }

    let atyp = header[3];
    if !matches!(atyp, ATYP_IPV4 | ATYP_DOMAIN | ATYP_IPV6) {
        send_reply(&mut stream, REP_ADDRESS_TYPE_NOT_SUPPORTED).await?;
        return Err(Error::protocol(format!(
            "unsupported address type: {}",
            atyp
        )));
    }

    let address = match RawAddress::read_from(&mut stream, atyp).await {
        Ok(address) => address,
        Err(e) => {
            send_reply(&mut stream, REP_GENERAL_FAILURE).await?;
            return Err(e);
        }
    };
    let target = address.to_target();
    debug!("SOCKS5 target: {}", target);

    let Some(upstream) = pool.select_random(pool::socks5_filter) else {
        info!(
            "No SOCKS5 upstream available, connecting directly to {}",
            target
        );
        let remote = match outbound::dial(&target).await {
            Ok(remote) => remote,
            Err(e) => {
                send_reply(&mut stream, REP_HOST_UNREACHABLE).await?;
                return Err(e);
            }
        };

        stream.write_all(&success_reply()).await?;
        relay(stream, remote, peer_addr, &target).await;
        return Ok(());
    };

    info!("Using SOCKS5 upstream {}", upstream.url);
    let remote = match outbound::socks5::connect_via(&upstream, &address).await {
        Ok(remote) => remote,
        Err(chain) => {
            send_reply(&mut stream, chain.reply).await?;
            pool.mark_failed(&upstream);
            return Err(chain.error);
        }
    };

    stream.write_all(&success_reply()).await?;
    pool.mark_success(&upstream);
    info!(
        "SOCKS5 connection established to {} via {}",
        target, upstream.url
    );

    relay(stream, remote, peer_addr, &target).await;
    Ok(())
}

async fn relay(stream: HandshakeStream, remote: TcpStream, peer_addr: SocketAddr, target: &str) {
    let client = stream.into_prefixed();
    let (sent, received) = copy_bidirectional(client, remote).await;
    debug!(
        "SOCKS5 {} -> {} done (sent: {}, recv: {})",
        peer_addr, target, sent, received
    );
}

fn success_reply() -> [u8; 10] {
    [
        SOCKS5_VERSION,
        REP_SUCCEEDED,
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}

/// Error replies always carry the fixed `0.0.0.0:0` bind tail.
async fn send_reply(stream: &mut HandshakeStream, code: u8) -> Result<()> {
    stream
        .write_all(&[
            SOCKS5_VERSION,
            code,
            0x00,
            ATYP_IPV4,
            0,
            0,
            0,
            0,
            0,
            0,
        ])
        .await?;
    Ok(())
}
