//! SOCKS5 wire protocol pieces (RFC 1928 / RFC 1929)

use crate::common::net::read_u16_be;
use crate::{Error, Result};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

// SOCKS5 version
pub const SOCKS5_VERSION: u8 = 0x05;

// SOCKS5 authentication methods
pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_USERNAME_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

// SOCKS5 commands
pub const CMD_CONNECT: u8 = 0x01;

// SOCKS5 address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// SOCKS5 reply codes
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Convert reply code to error message
pub fn reply_error_message(code: u8) -> String {
    match code {
        REP_GENERAL_FAILURE => "General SOCKS server failure".to_string(),
        REP_CONNECTION_NOT_ALLOWED => "Connection not allowed by ruleset".to_string(),
        REP_NETWORK_UNREACHABLE => "Network unreachable".to_string(),
        REP_HOST_UNREACHABLE => "Host unreachable".to_string(),
        REP_CONNECTION_REFUSED => "Connection refused".to_string(),
        REP_TTL_EXPIRED => "TTL expired".to_string(),
        REP_COMMAND_NOT_SUPPORTED => "Command not supported".to_string(),
        REP_ADDRESS_TYPE_NOT_SUPPORTED => "Address type not supported".to_string(),
        _ => format!("Unknown error: {}", code),
    }
}

/// A destination address as it appeared on the wire.
///
/// The raw ATYP and address bytes are kept so a chained request toward
/// an upstream re-emits exactly what the client sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAddress {
    pub atyp: u8,
    raw: Vec<u8>,
    pub port: u16,
}

impl RawAddress {
    /// Read the address and port for a previously consumed ATYP byte.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R, atyp: u8) -> Result<Self> {
        let raw = match atyp {
            ATYP_IPV4 => {
                let mut buf = [0u8; 4];
                reader.read_exact(&mut buf).await?;
                buf.to_vec()
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                reader.read_exact(&mut len).await?;
                let mut domain = vec![0u8; len[0] as usize];
                reader.read_exact(&mut domain).await?;
                let mut raw = Vec::with_capacity(1 + domain.len());
                raw.push(len[0]);
                raw.extend_from_slice(&domain);
                raw
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 16];
                reader.read_exact(&mut buf).await?;
                buf.to_vec()
            }
            t => return Err(Error::protocol(format!("unknown address type: {}", t))),
        };

        let port = read_u16_be(reader).await?;

        Ok(RawAddress { atyp, raw, port })
    }

    /// Append ATYP, address bytes, and port exactly as received.
    pub fn append_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.atyp);
        buf.extend_from_slice(&self.raw);
        buf.extend_from_slice(&self.port.to_be_bytes());
    }

    /// Wire length: ATYP + address bytes + port.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        1 + self.raw.len() + 2
    }

    /// The host part rendered for logging and direct dialing.
    pub fn host(&self) -> String {
        match self.atyp {
            ATYP_IPV4 if self.raw.len() == 4 => {
                Ipv4Addr::new(self.raw[0], self.raw[1], self.raw[2], self.raw[3]).to_string()
            }
            ATYP_IPV6 if self.raw.len() == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.raw);
                Ipv6Addr::from(octets).to_string()
            }
            _ => String::from_utf8_lossy(self.raw.get(1..).unwrap_or_default()).to_string(),
        }
    }

    /// `host:port` suitable for a TCP dial (IPv6 bracketed).
    pub fn to_target(&self) -> String {
        match self.atyp {
            ATYP_IPV6 => format!("[{}]:{}", self.host(), self.port),
            _ => format!("{}:{}", self.host(), self.port),
        }
    }
}
