use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

pub(crate) const DEFAULT_CAPACITY: usize = 1024;

/// A read-buffering adapter over a byte stream.
///
/// Reads drain the internal buffer first; only with an empty buffer is a
/// single read issued against the inner stream (buffered and direct reads
/// are never coalesced). Writes pass straight through.
pub(crate) struct BufferedStream<S> {
    inner: S,
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
}

impl<S> BufferedStream<S> {
    pub(crate) fn new(inner: S) -> BufferedStream<S> {
        BufferedStream::with_capacity(DEFAULT_CAPACITY, inner)
    }

    pub(crate) fn with_capacity(capacity: usize, inner: S) -> BufferedStream<S> {
        BufferedStream {
            inner,
            buf: vec![0; capacity].into_boxed_slice(),
            pos: 0,
            filled: 0,
        }
    }

    fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..self.filled]
    }
}

impl<S: AsyncRead + Unpin> BufferedStream<S> {
    /// Expose buffered bytes, issuing at most one inner read when empty.
    /// An empty return means the inner stream hit EOF.
    pub(crate) fn poll_fill_buf(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        if self.pos == self.filled {
            self.pos = 0;
            self.filled = 0;
            let mut read_buf = ReadBuf::new(&mut self.buf);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut read_buf))?;
            self.filled = read_buf.filled().len();
        }
        Poll::Ready(Ok(&self.buf[self.pos..self.filled]))
    }

    pub(crate) fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.filled);
    }

    async fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if self.pos == self.filled {
            self.pos = 0;
            let n = self.inner.read(&mut self.buf).await?;
            self.filled = n;
            if n == 0 {
                return Ok(None);
            }
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        Ok(Some(byte))
    }

    /// Read one CRLF-terminated line, scanning byte by byte.
    ///
    /// The returned line excludes the terminator. A partial line at EOF is
    /// returned verbatim, including a dangling `\r` with no `\n` after it.
    pub(crate) async fn read_line(&mut self) -> io::Result<String> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            match self.read_byte().await? {
                Some(b'\n') if line.last() == Some(&b'\r') => {
                    line.pop();
                    break;
                }
                Some(byte) => line.push(byte),
                None => break,
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Compact the buffer and fill until at least `min` bytes are buffered.
    ///
    /// Returns `Ok(false)` when the inner stream ends first. `min` larger
    /// than the buffer capacity is a caller bug and is rejected.
    pub(crate) async fn ensure_buffered(&mut self, min: usize) -> io::Result<bool> {
        if min > self.buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "requested more bytes than the buffer capacity",
            ));
        }
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.filled, 0);
            self.filled -= self.pos;
            self.pos = 0;
        }
        while self.filled < min {
            let n = self.inner.read(&mut self.buf[self.filled..]).await?;
            if n == 0 {
                return Ok(false);
            }
            self.filled += n;
        }
        Ok(true)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        let pending = me.buffered();
        if !pending.is_empty() {
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending[..n]);
            me.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
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
