//! Response body streams.
//!
//! A response body is the tunnel's remaining bytes seen through a framing
//! decoder (chunked, content-length, read-to-close or empty) and optionally
//! a gzip/deflate decompressor. The body holds the pooled-tunnel borrow:
//! dropping it releases the tunnel, and only a body consumed to its framing
//! end releases the tunnel in a reusable state.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_compression::tokio::bufread::{DeflateDecoder, GzipDecoder};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf};

use crate::buffered::BufferedStream;
use crate::connect::Tunnel;
use crate::pool::Pooled;

/// How the end of the response body is determined.
#[derive(Debug)]
pub(crate) enum Framing {
    Chunked(ChunkState),
    Length(u64),
    Close,
    Empty,
}

impl Framing {
    pub(crate) fn chunked() -> Framing {
        Framing::Chunked(ChunkState::Size)
    }
}

#[derive(Debug)]
pub(crate) enum ChunkState {
    /// Accumulating the hex size line.
    Size,
    /// Inside a chunk with this many bytes left.
    Data(u64),
    /// Consuming the CRLF that closes a chunk.
    DataEnd,
    /// Consuming the CRLF after the zero-length chunk.
    TrailerEnd,
    Done,
}

/// Content-Encoding values the client decodes transparently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Coding {
    Gzip,
    Deflate,
}

/// The framing state machine, driven against any buffered stream.
pub(crate) struct Decoder {
    framing: Framing,
    line: Vec<u8>,
}

impl Decoder {
    pub(crate) fn new(framing: Framing) -> Decoder {
        Decoder {
            framing,
            line: Vec::new(),
        }
    }

    /// True once the body ended through its framing, which leaves the
    /// tunnel positioned at the next response and therefore reusable.
    /// Close-delimited bodies never complete this way.
    pub(crate) fn framing_complete(&self) -> bool {
        matches!(
            self.framing,
            Framing::Empty | Framing::Length(0) | Framing::Chunked(ChunkState::Done)
        )
    }

    pub(crate) fn poll_read<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut BufferedStream<S>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            match self.framing {
                Framing::Empty => return Poll::Ready(Ok(())),
                Framing::Length(0) => return Poll::Ready(Ok(())),
                Framing::Length(ref mut remaining) => {
                    let n = ready!(read_limited(stream, cx, out, *remaining))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed before the full content length",
                        )));
                    }
                    *remaining -= n as u64;
                    return Poll::Ready(Ok(()));
                }
                Framing::Close => return Pin::new(stream).poll_read(cx, out),
                Framing::Chunked(ref mut state) => match state {
                    ChunkState::Done => return Poll::Ready(Ok(())),
                    ChunkState::Size => {
                        ready!(poll_line(stream, cx, &mut self.line))?;
                        let size = parse_chunk_size(&self.line)?;
                        self.line.clear();
                        *state = if size == 0 {
                            ChunkState::TrailerEnd
                        } else {
                            ChunkState::Data(size)
                        };
                    }
                    ChunkState::Data(remaining) => {
                        let n = ready!(read_limited(stream, cx, out, *remaining))?;
                        if n == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed inside a chunk",
                            )));
                        }
                        *remaining -= n as u64;
                        if *remaining == 0 {
                            *state = ChunkState::DataEnd;
                        }
                        return Poll::Ready(Ok(()));
                    }
                    ChunkState::DataEnd => {
                        ready!(poll_line(stream, cx, &mut self.line))?;
                        if !self.line.is_empty() {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "expected CRLF after chunk data",
                            )));
                        }
                        *state = ChunkState::Size;
                    }
                    ChunkState::TrailerEnd => {
                        ready!(poll_line(stream, cx, &mut self.line))?;
                        if !self.line.is_empty() {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "unexpected trailer after final chunk",
                            )));
                        }
                        *state = ChunkState::Done;
                    }
                },
            }
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size line"))?;
    u64::from_str_radix(text.trim(), 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid chunk size line: {text:?}"),
        )
    })
}

/// Read at most `limit` bytes into `out`, bounded by one scratch buffer.
fn read_limited<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
    cx: &mut Context<'_>,
    out: &mut ReadBuf<'_>,
    limit: u64,
) -> Poll<io::Result<usize>> {
    let mut tmp = [0u8; 2048];
    let max = (out.remaining() as u64).min(limit).min(tmp.len() as u64) as usize;
    if max == 0 {
        return Poll::Ready(Ok(0));
    }
    let mut buf = ReadBuf::new(&mut tmp[..max]);
    ready!(Pin::new(&mut *stream).poll_read(cx, &mut buf))?;
    out.put_slice(buf.filled());
    Poll::Ready(Ok(buf.filled().len()))
}

/// Accumulate bytes into `line` until a CRLF is consumed; the terminator is
/// stripped. Partial progress survives across `Pending` returns.
fn poll_line<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
    cx: &mut Context<'_>,
    line: &mut Vec<u8>,
) -> Poll<io::Result<()>> {
    loop {
        let available = ready!(stream.poll_fill_buf(cx))?;
        if available.is_empty() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of stream in chunk framing",
            )));
        }
        let mut advance = available.len();
        let mut found = false;
        for (i, &byte) in available.iter().enumerate() {
            if byte == b'\n' && line.last() == Some(&b'\r') {
                line.pop();
                advance = i + 1;
                found = true;
                break;
            }
            line.push(byte);
        }
        stream.consume(advance);
        if found {
            return Poll::Ready(Ok(()));
        }
    }
}

/// The framed remainder of a pooled tunnel.
///
/// Owns the pool borrow; reaching the framing end re-arms the tunnel for
/// reuse, anything less leaves it poisoned.
pub(crate) struct FramedReader {
    conn: Pooled<Tunnel>,
    decoder: Decoder,
    completed: bool,
}

impl FramedReader {
    pub(crate) fn new(conn: Pooled<Tunnel>, framing: Framing) -> FramedReader {
        let mut reader = FramedReader {
            conn,
            decoder: Decoder::new(framing),
            completed: false,
        };
        if reader.decoder.framing_complete() {
            reader.finish();
        }
        reader
    }

    fn finish(&mut self) {
        if !self.completed {
            self.completed = true;
            self.conn.complete();
            log::trace!("response consumed to its framing end; tunnel reusable");
        }
    }
}

impl AsyncRead for FramedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        let stream = match me.conn.stream_if_open() {
            Some(stream) => stream,
            None => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "tunnel closed",
                )))
            }
        };
        ready!(me.decoder.poll_read(stream, cx, out))?;
        if me.decoder.framing_complete() {
            me.finish();
        }
        Poll::Ready(Ok(()))
    }
}

/// A streaming response body.
///
/// Implements [`AsyncRead`]; dropping it without reading to the end
/// discards the underlying tunnel instead of returning it to the pool.
pub struct Body {
    inner: Inner,
    drained: bool,
}

enum Inner {
    Plain(FramedReader),
    Gzip(Box<GzipDecoder<BufReader<FramedReader>>>),
    Deflate(Box<DeflateDecoder<BufReader<FramedReader>>>),
}

impl Body {
    pub(crate) fn new(reader: FramedReader, coding: Option<Coding>) -> Body {
        let inner = match coding {
            None => Inner::Plain(reader),
            Some(Coding::Gzip) => Inner::Gzip(Box::new(GzipDecoder::new(BufReader::new(reader)))),
            Some(Coding::Deflate) => {
                Inner::Deflate(Box::new(DeflateDecoder::new(BufReader::new(reader))))
            }
        };
        Body {
            inner,
            drained: false,
        }
    }

    /// Read and discard the rest of the body.
    pub(crate) async fn drain(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 512];
        while self.read(&mut scratch).await? > 0 {}
        Ok(())
    }
}

impl AsyncRead for Body {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        match me.inner {
            Inner::Plain(ref mut reader) => Pin::new(reader).poll_read(cx, out),
            Inner::Gzip(ref mut decoder) => {
                if !me.drained {
                    let before = out.filled().len();
                    ready!(Pin::new(&mut **decoder).poll_read(cx, out))?;
                    if out.filled().len() > before {
                        return Poll::Ready(Ok(()));
                    }
                    me.drained = true;
                }
                poll_drain_framing(decoder.get_mut().get_mut(), cx)
            }
            Inner::Deflate(ref mut decoder) => {
                if !me.drained {
                    let before = out.filled().len();
                    ready!(Pin::new(&mut **decoder).poll_read(cx, out))?;
                    if out.filled().len() > before {
                        return Poll::Ready(Ok(()));
                    }
                    me.drained = true;
                }
                poll_drain_framing(decoder.get_mut().get_mut(), cx)
            }
        }
    }
}

/// After the decompressor signals EOF the framing underneath may still hold
/// tail bytes (the terminating chunk, a gzip trailer inside the length
/// framing). Consume them so the tunnel is observed fully read and stays
/// eligible for reuse.
fn poll_drain_framing(reader: &mut FramedReader, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let mut scratch = [0u8; 64];
    loop {
        let mut buf = ReadBuf::new(&mut scratch);
        ready!(Pin::new(&mut *reader).poll_read(cx, &mut buf))?;
        if buf.filled().is_empty() {
            return Poll::Ready(Ok(()));
        }
    }
}
