//! Inbound listener and protocol demultiplexer
//!
//! Every accepted connection has its first byte peeked without being
//! consumed: `0x05` routes to the SOCKS5 bridge (the byte is the start
//! of the greeting), anything else is read as an HTTP request line and
//! routed to the CONNECT or plain-HTTP bridge.

mod connect;
mod http;
mod socks5;

use crate::common::net::{configure_tcp_stream, PrefixedStream};
use crate::common::socks::SOCKS5_VERSION;
use crate::pool::ProxyPool;
use crate::{Error, Result};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Buffered view of a freshly accepted connection, able to peek the
/// first byte and to hand leftover buffered bytes over to the relay.
pub(crate) struct HandshakeStream {
    reader: BufReader<TcpStream>,
}

impl HandshakeStream {
    fn new(stream: TcpStream) -> Self {
        Self {
            reader: BufReader::with_capacity(8 * 1024, stream),
        }
    }

    async fn peek_u8(&mut self) -> Result<u8> {
        let buf = self.reader.fill_buf().await?;
        buf.first()
            .copied()
            .ok_or_else(|| Error::protocol("unexpected EOF"))
    }

    /// Convert into a stream that replays any bytes still sitting in
    /// the handshake buffer before touching the socket again.
    pub(crate) fn into_prefixed(self) -> PrefixedStream {
        PrefixedStream::from_buf_reader(self.reader)
    }
}

impl AsyncRead for HandshakeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncBufRead for HandshakeStream {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        Pin::new(&mut self.get_mut().reader).poll_fill_buf(cx)
    }

    fn consume(mut self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.reader).consume(amt)
    }
}

impl AsyncWrite for HandshakeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(self.reader.get_mut()).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.reader.get_mut()).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.reader.get_mut()).poll_shutdown(cx)
    }
}

/// The proxy's accept loop.
pub struct Listener {
    listener: TcpListener,
    pool: Arc<ProxyPool>,
}

impl Listener {
    pub async fn bind(addr: &str, pool: Arc<ProxyPool>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::config(format!("failed to listen on {}: {}", addr, e)))?;
        Ok(Listener { listener, pool })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is aborted. Each connection
    /// is served on its own task.
    pub async fn run(&self) -> Result<()> {
        info!("Proxy server listening on {}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    configure_tcp_stream(&stream);
                    let pool = self.pool.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer_addr, pool).await;
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, pool: Arc<ProxyPool>) {
    if let Err(e) = dispatch(stream, peer_addr, &pool).await {
        debug!("Connection error from {}: {}", peer_addr, e);
    }
}

async fn dispatch(stream: TcpStream, peer_addr: SocketAddr, pool: &ProxyPool) -> Result<()> {
    let mut stream = HandshakeStream::new(stream);

    let first = stream.peek_u8().await?;
    if first == SOCKS5_VERSION {
        debug!("Detected SOCKS5 from {}", peer_addr);
        return socks5::handle(stream, peer_addr, pool).await;
    }

    let mut first_line = String::new();
    stream.read_line(&mut first_line).await?;

    if first_line.starts_with("CONNECT ") {
        connect::handle(stream, peer_addr, first_line, pool).await
    } else {
        http::handle(stream, peer_addr, first_line, pool).await
    }
}
