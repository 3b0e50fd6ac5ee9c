//! Byte framing helpers shared by the protocol engines: delimiter scans,
//! deadline-driven reads, and a prefix-replaying stream for handing already
//! consumed detection bytes back to a parser.

use crate::error::ProxyError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::time::{Duration, timeout};

const READ_CHUNK_SIZE: usize = 16384;

/// Finds the end of an HTTP header block, returning the index one past the
/// terminating `\r\n\r\n`.
#[inline]
pub fn find_double_crlf(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Finds the next CRLF, returning the index of the `\r`.
#[inline]
pub fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\r\n")
}

/// Hex preview of the first bytes of a buffer, for protocol-violation logs.
pub fn hex_preview(bytes: &[u8], max: usize) -> String {
    bytes[..bytes.len().min(max)]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reads one chunk from `reader` into `buf` under `deadline`. Returns the
/// number of bytes read; 0 means EOF.
pub async fn read_some<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    deadline: Duration,
) -> Result<usize, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let n = timeout(deadline, reader.read(&mut chunk)).await??;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

/// Appends reads until `buf` contains `want` bytes. The deadline applies to
/// each read, not the total. EOF before `want` is a short read.
pub async fn read_at_least<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    want: usize,
    deadline: Duration,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < want {
        let n = read_some(reader, buf, deadline).await?;
        if n == 0 {
            return Err(ProxyError::ShortRead);
        }
    }
    Ok(())
}

/// A stream that replays an already-consumed prefix before the inner stream.
///
/// Protocol detection has to consume bytes it cannot push back into the
/// socket; the selected engine reads through this wrapper and observes the
/// connection from its first byte. Writes go straight to the inner stream.
pub struct Rewind<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
