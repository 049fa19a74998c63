//! Establishing tunnels through the upstream proxy.
//!
//! `ProxyConnector` opens the TCP connection to the proxy and runs the
//! dialect handshake; `Tunnel` wraps the result with its (optional) TLS
//! upgrade and buffered transport, realised lazily on first use.

pub(crate) mod http_tunnel;
pub(crate) mod socks;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::buffered::BufferedStream;
use crate::error;
use crate::proxy::{Dialect, Proxy};
use crate::tls;
use crate::util;

/// How long the proxy gets to answer each handshake read.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Opens TCP connections to the configured proxy and negotiates tunnels.
pub(crate) struct ProxyConnector {
    proxy: Proxy,
    send_timeout: Option<Duration>,
    recv_timeout: Option<Duration>,
}

impl ProxyConnector {
    pub(crate) fn new(
        proxy: Proxy,
        send_timeout: Option<Duration>,
        recv_timeout: Option<Duration>,
    ) -> ProxyConnector {
        ProxyConnector {
            proxy,
            send_timeout,
            recv_timeout,
        }
    }

    /// Connect to the proxy and negotiate a tunnel to `host:port`.
    ///
    /// On success the returned socket carries end-to-end bytes between the
    /// caller and the destination. After any error the socket must be
    /// discarded, not retried.
    pub(crate) async fn establish(&self, host: &str, port: u16) -> crate::Result<TcpStream> {
        log::trace!(
            "establishing {:?} tunnel to {}:{} via {}:{}",
            self.proxy.dialect(),
            host,
            port,
            self.proxy.host(),
            self.proxy.port_num(),
        );
        let connect = TcpStream::connect((self.proxy.host(), self.proxy.port_num()));
        let mut stream = util::timed(self.send_timeout, connect).await.map_err(|e| {
            error::proxy(format!(
                "failed to connect to proxy {}:{}: {e}",
                self.proxy.host(),
                self.proxy.port_num()
            ))
        })?;

        let mut io = ProxyIo {
            stream: &mut stream,
            send_timeout: self.send_timeout,
            recv_timeout: self.recv_timeout,
        };
        match self.proxy.dialect() {
            Dialect::Http => {
                http_tunnel::handshake(&mut io, host, port, self.proxy.auth()).await?
            }
            Dialect::Socks4 => {
                let user = self.proxy.auth().map(|(u, _)| u).unwrap_or("");
                socks::socks4_handshake(&mut io, host, port, user, false).await?
            }
            Dialect::Socks4a => {
                let user = self.proxy.auth().map(|(u, _)| u).unwrap_or("");
                socks::socks4_handshake(&mut io, host, port, user, true).await?
            }
            Dialect::Socks5 => {
                socks::socks5_handshake(&mut io, host, port, self.proxy.auth()).await?
            }
        }
        log::debug!("tunnel to {host}:{port} established");
        Ok(stream)
    }
}

/// The proxy-side socket plus the configured per-operation timeouts.
///
/// Handshake writes run under the send timeout; handshake reads run under
/// the receive timeout and the hard handshake deadline, whichever is
/// shorter.
pub(crate) struct ProxyIo<'a> {
    stream: &'a mut TcpStream,
    send_timeout: Option<Duration>,
    recv_timeout: Option<Duration>,
}

impl ProxyIo<'_> {
    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> crate::Result<()> {
        util::timed(self.send_timeout, self.stream.write_all(buf))
            .await
            .map_err(|e| error::proxy(format!("failed to send proxy request: {e}")))
    }

    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> crate::Result<()> {
        let fut = util::timed(self.recv_timeout, self.stream.read_exact(buf));
        Self::deadline(fut).await?;
        Ok(())
    }

    /// Issue a single read, returning however many bytes the proxy sent.
    pub(crate) async fn read_some(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        let fut = util::timed(self.recv_timeout, self.stream.read(buf));
        Self::deadline(fut).await
    }

    pub(crate) async fn read_byte(&mut self) -> crate::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        let n = self.read_some(&mut byte).await?;
        Ok((n == 1).then_some(byte[0]))
    }

    async fn deadline<F, T>(fut: F) -> crate::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
                Err(error::proxy("timed out waiting for proxy response"))
            }
            Ok(Err(e)) => Err(error::proxy(format!("failed to read proxy response: {e}"))),
            Err(_) => Err(error::proxy("timed out waiting for proxy response")),
        }
    }
}

/// The tunnelled byte stream, plain or wrapped in a TLS session.
pub(crate) enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

/// One pooled tunnel to a destination host.
///
/// The stream is realised lazily: the first call to [`Tunnel::stream`] runs
/// the proxy handshake and, for https destinations, the TLS upgrade, then
/// caches the buffered transport.
///
/// `broken` is pessimistic: it is raised when an exchange begins and only
/// cleared when the response body reaches its framing end, so a tunnel
/// abandoned mid-response is replaced instead of reused.
pub(crate) struct Tunnel {
    connector: Arc<ProxyConnector>,
    host: String,
    port: u16,
    tls: Option<Arc<rustls::ClientConfig>>,
    stream: Option<BufferedStream<MaybeTlsStream>>,
    broken: bool,
}

impl Tunnel {
    pub(crate) fn new(
        connector: Arc<ProxyConnector>,
        host: String,
        port: u16,
        tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Tunnel {
        Tunnel {
            connector,
            host,
            port,
            tls,
            stream: None,
            broken: false,
        }
    }

    pub(crate) async fn stream(&mut self) -> crate::Result<&mut BufferedStream<MaybeTlsStream>> {
        if self.stream.is_none() {
            let tcp = self.connector.establish(&self.host, self.port).await?;
            let io = match self.tls {
                Some(ref config) => MaybeTlsStream::Tls(Box::new(
                    tls::handshake(tcp, &self.host, config.clone()).await?,
                )),
                None => MaybeTlsStream::Plain(tcp),
            };
            self.stream = Some(BufferedStream::new(io));
        }
        match self.stream {
            Some(ref mut stream) => Ok(stream),
            None => unreachable!(),
        }
    }

    pub(crate) fn stream_if_open(&mut self) -> Option<&mut BufferedStream<MaybeTlsStream>> {
        self.stream.as_mut()
    }

    /// Mark the tunnel in-flight; it stays poisoned until `complete`.
    pub(crate) fn begin(&mut self) {
        self.broken = true;
    }

    /// The response was consumed to its framing end; the tunnel may be
    /// handed to the next borrower.
    pub(crate) fn complete(&mut self) {
        self.broken = false;
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken
    }
}
