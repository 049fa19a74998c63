use std::fmt;

/// Configuration of the upstream proxy a [`Client`](crate::Client) tunnels
/// through.
///
/// A `Proxy` names one of the four supported dialects, the proxy endpoint,
/// and optional credentials:
///
/// ```rust
/// let proxy = culvert::Proxy::socks5("192.168.1.1")
///     .port(9050)
///     .basic_auth("user", "pass");
/// ```
///
/// Every request sent by a client built with this proxy is tunnelled through
/// it; there is no direct-connection fallback.
#[derive(Clone)]
pub struct Proxy {
    dialect: Dialect,
    host: String,
    port: u16,
    auth: Option<(String, String)>,
}

/// The proxy wire protocol spoken against the upstream server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    /// HTTP `CONNECT` tunnelling.
    Http,
    /// SOCKS4 with client-side DNS resolution.
    Socks4,
    /// SOCKS4a, hostnames resolved by the proxy.
    Socks4a,
    /// SOCKS5 per RFC 1928, optionally with username/password auth.
    Socks5,
}

impl Dialect {
    /// The conventional port for this dialect, used when none is given.
    pub fn default_port(&self) -> u16 {
        match self {
            Dialect::Http => 8080,
            Dialect::Socks4 | Dialect::Socks4a | Dialect::Socks5 => 1080,
        }
    }
}

impl Proxy {
    fn new(dialect: Dialect, host: impl Into<String>) -> Proxy {
        Proxy {
            dialect,
            host: host.into(),
            port: dialect.default_port(),
            auth: None,
        }
    }

    /// Tunnel through an HTTP `CONNECT` proxy at `host` (port 8080 unless
    /// overridden with [`port`](Proxy::port)).
    pub fn http(host: impl Into<String>) -> Proxy {
        Proxy::new(Dialect::Http, host)
    }

    /// Tunnel through a SOCKS4 proxy at `host` (port 1080 unless overridden).
    pub fn socks4(host: impl Into<String>) -> Proxy {
        Proxy::new(Dialect::Socks4, host)
    }

    /// Tunnel through a SOCKS4a proxy at `host` (port 1080 unless overridden).
    ///
    /// Unlike SOCKS4, destination hostnames are passed to the proxy for
    /// resolution instead of being resolved locally.
    pub fn socks4a(host: impl Into<String>) -> Proxy {
        Proxy::new(Dialect::Socks4a, host)
    }

    /// Tunnel through a SOCKS5 proxy at `host` (port 1080 unless overridden).
    pub fn socks5(host: impl Into<String>) -> Proxy {
        Proxy::new(Dialect::Socks5, host)
    }

    /// Override the proxy port.
    pub fn port(mut self, port: u16) -> Proxy {
        self.port = port;
        self
    }

    /// Attach credentials.
    ///
    /// For HTTP proxies these become a `Proxy-Authorization: Basic` header;
    /// for SOCKS5 they drive the username/password subnegotiation; for
    /// SOCKS4/4a the username is sent as the userid field.
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Proxy {
        self.auth = Some((username.into(), password.into()));
        self
    }

    pub(crate) fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port_num(&self) -> u16 {
        self.port
    }

    pub(crate) fn auth(&self) -> Option<(&str, &str)> {
        self.auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()))
    }

    /// Endpoint sanity checks, run when the client is built.
    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.host.is_empty() {
            return Err(crate::error::builder("proxy host must not be empty"));
        }
        if self.port == 0 {
            return Err(crate::error::builder("proxy port must be in 1..=65535"));
        }
        Ok(())
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("dialect", &self.dialect)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("auth", &self.auth.as_ref().map(|(u, _)| (u, "********")))
            .finish()
    }
}
