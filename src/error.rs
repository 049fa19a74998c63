use std::error::Error as StdError;
use std::fmt;

use url::Url;

/// A `Result` alias where the `Err` case is `culvert::Error`.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

/// The Errors that may occur when sending a request through a proxy tunnel.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    url: Option<Url>,
}

impl Error {
    pub(crate) fn new(kind: Kind, source: Option<BoxError>) -> Error {
        Error {
            inner: Box::new(Inner {
                kind,
                source,
                url: None,
            }),
        }
    }

    /// Returns the URL associated with this error, if any.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// Attach a URL to this error.
    pub fn with_url(mut self, url: Url) -> Error {
        self.inner.url = Some(url);
        self
    }

    /// Returns true if the error came from client or proxy configuration.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the error occurred while negotiating with the proxy.
    pub fn is_proxy(&self) -> bool {
        matches!(self.inner.kind, Kind::Proxy)
    }

    /// Returns true if the error came from malformed HTTP on the tunnel.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if waiting for a free pooled tunnel timed out.
    pub fn is_pool_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolTimeout)
    }

    /// Returns true if the underlying transport failed.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if the operation was cancelled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Proxy,
    Protocol,
    PoolTimeout,
    Io,
    Canceled,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("culvert::Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref url) = self.inner.url {
            builder.field("url", url);
        }
        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Proxy => f.write_str("proxy error")?,
            Kind::Protocol => f.write_str("protocol error")?,
            Kind::PoolTimeout => f.write_str("timed out waiting for a pooled connection")?,
            Kind::Io => f.write_str("connection error")?,
            Kind::Canceled => f.write_str("operation canceled")?,
        }
        if let Some(ref url) = self.inner.url {
            write!(f, " for url ({url})")?;
        }
        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

// constructors used across the crate

pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Builder, Some(e.into()))
}

pub(crate) fn proxy<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Proxy, Some(e.into()))
}

pub(crate) fn protocol<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Protocol, Some(e.into()))
}

pub(crate) fn pool_timeout() -> Error {
    Error::new(Kind::PoolTimeout, None)
}

pub(crate) fn io(e: std::io::Error) -> Error {
    Error::new(Kind::Io, Some(Box::new(e)))
}

pub(crate) fn canceled() -> Error {
    Error::new(Kind::Canceled, None)
}

/// Classify an I/O error coming off a response body: the framing and
/// decompression layers report malformed data as `InvalidData`, everything
/// else is transport failure.
pub(crate) fn body_io(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::InvalidData {
        protocol(e)
    } else {
        io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_url_and_source() {
        let url = Url::parse("http://example.com/x").unwrap();
        let err = proxy("no acceptable auth methods").with_url(url);
        let text = err.to_string();
        assert!(text.contains("proxy error"), "{text}");
        assert!(text.contains("http://example.com/x"), "{text}");
        assert!(text.contains("no acceptable auth methods"), "{text}");
    }

    #[test]
    fn predicates_match_kind() {
        assert!(pool_timeout().is_pool_timeout());
        assert!(canceled().is_canceled());
        assert!(builder("x").is_builder());
        assert!(protocol("x").is_protocol());
        assert!(io(std::io::Error::new(std::io::ErrorKind::Other, "x")).is_io());
    }

    #[test]
    fn body_io_classifies_invalid_data_as_protocol() {
        let e = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad chunk size");
        assert!(body_io(e).is_protocol());
        let e = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(body_io(e).is_io());
    }
}
