//! Network utilities

use crate::Result;
use socket2::SockRef;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// Chunk size used by the relay loops.
pub const RELAY_CHUNK: usize = 32 * 1024;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Read 2 bytes as u16 big-endian
pub async fn read_u16_be<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

/// A `TcpStream` that replays already-buffered bytes before reading
/// from the socket again. Used to hand a stream that went through a
/// buffered handshake phase over to the relay without losing bytes.
#[derive(Debug)]
pub struct PrefixedStream {
    inner: TcpStream,
    prefix: Vec<u8>,
    pos: usize,
}

impl PrefixedStream {
    pub fn new(inner: TcpStream, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            prefix,
            pos: 0,
        }
    }

    pub fn from_buf_reader(reader: BufReader<TcpStream>) -> Self {
        let prefix = reader.buffer().to_vec();
        let inner = reader.into_inner();
        Self::new(inner, prefix)
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Copy data between two streams bidirectionally until either
/// direction terminates, then close both endpoints by dropping them.
///
/// Returns `(sent, received)` byte counts: bytes copied from `a` to
/// `b` and from `b` to `a`. Errors other than clean EOF are logged;
/// they do not propagate because by the time the relay starts, the
/// connection is considered established.
pub async fn copy_bidirectional<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let outcome = tokio::select! {
        r = copy_one_way(&mut ar, &mut bw, &sent) => r,
        r = copy_one_way(&mut br, &mut aw, &received) => r,
    };

    if let Err(e) = outcome {
        if e.kind() != io::ErrorKind::UnexpectedEof {
            debug!("relay error: {}", e);
        }
    }

    (sent.load(Ordering::Relaxed), received.load(Ordering::Relaxed))
}

async fn copy_one_way<R, W>(reader: &mut R, writer: &mut W, count: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        count.fetch_add(n as u64, Ordering::Relaxed);
    }
}
