use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use http::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION};
use http::Method;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::body::Body;
use crate::body::FramedReader;
use crate::connect::{ProxyConnector, Tunnel};
use crate::cookie::CookieStore;
use crate::error;
use crate::http1;
use crate::into_url::IntoUrl;
use crate::pool::{Pool, PoolKey, Pooled};
use crate::proxy::Proxy;
use crate::redirect;
use crate::request::{Request, RequestBuilder};
use crate::response::Response;
use crate::tls::{self, Certificate};
use crate::util;

/// A `Client` that sends every request through its configured proxy.
///
/// The client keeps one bounded pool of negotiated tunnels per destination
/// `(host, port, tls)`, so it is advised that you create one and **reuse**
/// it. Cloning is cheap; clones share the pools.
///
/// # Example
///
/// ```no_run
/// # async fn run() -> Result<(), culvert::Error> {
/// let client = culvert::Client::builder()
///     .proxy(culvert::Proxy::socks5("127.0.0.1").port(1080))
///     .build()?;
/// let body = client
///     .get("http://httpbin.org/ip")
///     .send()
///     .await?
///     .text()
///     .await?;
/// # drop(body);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connector: Arc<ProxyConnector>,
    tls: Arc<rustls::ClientConfig>,
    pools: RwLock<HashMap<PoolKey, Pool<Tunnel>>>,
    pool_max_per_host: usize,
    pool_acquire_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    recv_timeout: Option<Duration>,
    redirect: redirect::Policy,
    cookie_store: Option<Arc<dyn CookieStore>>,
    shutdown: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Ok(pools) = self.pools.get_mut() {
            for pool in pools.values() {
                pool.close();
            }
        }
    }
}

impl Client {
    /// Creates a `ClientBuilder` to configure a `Client`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Convenience method to make a `GET` request to a URL.
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Convenience method to make a `POST` request to a URL.
    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Convenience method to make a `PUT` request to a URL.
    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Convenience method to make a `DELETE` request to a URL.
    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Convenience method to make a `HEAD` request to a URL.
    pub fn head<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Start building a request with the given method and URL.
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        let request = url.into_url().map(|url| Request::new(method, url));
        RequestBuilder::new(self.clone(), request)
    }

    /// Executes a `Request`, following redirects per the configured policy.
    pub async fn execute(&self, request: Request) -> crate::Result<Response> {
        let mut req = request;
        let mut followed = 0usize;
        loop {
            let url = req.url().clone();
            let (head, mut body) = self
                .inner
                .exchange(&req)
                .await
                .map_err(|e| e.with_url(url.clone()))?;

            if self.inner.redirect.check(head.status, followed) == redirect::Action::Follow {
                if let Some(location) = head.headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
                    let next = resolve_location(&url, location)?;
                    // the tunnel is only reusable once the response has
                    // been consumed to its framing end
                    body.drain().await.map_err(error::body_io)?;
                    let method = redirect::redirect_method(head.status, req.method().clone());
                    log::debug!("redirect {} {} -> {}", head.status.as_u16(), url, next);
                    if method != *req.method() {
                        *req.body_mut() = None;
                        req.headers_mut().remove(CONTENT_LENGTH);
                        req.headers_mut().remove(CONTENT_TYPE);
                        *req.method_mut() = method;
                    }
                    *req.url_mut() = next;
                    followed += 1;
                    continue;
                }
            }

            return Ok(Response::new(
                url,
                head.status,
                head.version,
                head.headers,
                body,
            ));
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pool_max_per_host", &self.inner.pool_max_per_host)
            .finish()
    }
}

impl ClientInner {
    async fn exchange(&self, req: &Request) -> crate::Result<(http1::ResponseHead, Body)> {
        let url = req.url();
        let host = url
            .host_str()
            .ok_or_else(|| error::builder("url has no host"))?;
        let is_tls = url.scheme() == "https";
        let port = url.port().unwrap_or(if is_tls { 443 } else { 80 });
        let key = PoolKey {
            host: host.to_owned(),
            port,
            is_tls,
        };

        let pool = self.pool_for(&key);
        let mut conn = pool
            .acquire(self.pool_acquire_timeout, &self.shutdown)
            .await?;
        conn.begin();

        // any failure here leaves the tunnel poisoned; the guard returns
        // the slot and the next acquire replaces the value
        let mut head = self.run_exchange(&mut conn, req).await?;
        let framing = http1::body_framing(req.method(), &head)?;
        let coding = http1::content_coding(&mut head.headers);
        let body = Body::new(FramedReader::new(conn, framing), coding);
        Ok((head, body))
    }

    async fn run_exchange(
        &self,
        conn: &mut Pooled<Tunnel>,
        req: &Request,
    ) -> crate::Result<http1::ResponseHead> {
        let cookie_header = self.cookie_store.as_deref().and_then(|store| {
            if req.headers().contains_key(COOKIE) {
                None
            } else {
                store.cookies(req.url())
            }
        });

        let stream = conn.stream().await?;
        let head_bytes = http1::serialize_request(req, cookie_header);
        util::timed(self.send_timeout, stream.write_all(&head_bytes))
            .await
            .map_err(error::io)?;
        if let Some(body) = req.body() {
            util::timed(self.send_timeout, stream.write_all(body))
                .await
                .map_err(error::io)?;
        }
        util::timed(self.send_timeout, stream.flush())
            .await
            .map_err(error::io)?;

        let head = http1::read_head(stream, self.recv_timeout).await?;
        if let Some(ref store) = self.cookie_store {
            if !head.set_cookies.is_empty() {
                store.set_cookies(&mut head.set_cookies.iter(), req.url());
            }
        }
        Ok(head)
    }

    fn pool_for(&self, key: &PoolKey) -> Pool<Tunnel> {
        if let Some(pool) = self.pools.read().unwrap().get(key) {
            return pool.clone();
        }
        let mut pools = self.pools.write().unwrap();
        if let Some(pool) = pools.get(key) {
            return pool.clone();
        }
        let connector = self.connector.clone();
        let host = key.host.clone();
        let port = key.port;
        let tls = key.is_tls.then(|| self.tls.clone());
        let pool = Pool::new(
            self.pool_max_per_host,
            move || {
                let connector = connector.clone();
                let host = host.clone();
                let tls = tls.clone();
                async move { Ok(Tunnel::new(connector, host, port, tls)) }
            },
            Some(Box::new(|tunnel: &Tunnel| tunnel.is_broken())),
            None,
        );
        log::debug!(
            "new tunnel pool for {}:{} (tls: {})",
            key.host,
            key.port,
            key.is_tls
        );
        pools.insert(key.clone(), pool.clone());
        pool
    }
}

/// An absolute `Location` is used as-is; a relative one resolves against
/// the root of the current authority.
fn resolve_location(base: &Url, location: &str) -> crate::Result<Url> {
    match Url::parse(location) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let mut root = base.clone();
            root.set_path("/");
            root.set_query(None);
            root.set_fragment(None);
            root.join(location)
                .map_err(|e| error::protocol(format!("invalid Location header: {e}")))
        }
        Err(e) => Err(error::protocol(format!("invalid Location header: {e}"))),
    }
}

/// A `ClientBuilder` can be used to create a `Client` with custom
/// configuration.
#[derive(Debug)]
pub struct ClientBuilder {
    config: Config,
}

struct Config {
    proxy: Option<Proxy>,
    pool_max_per_host: usize,
    pool_acquire_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    recv_timeout: Option<Duration>,
    redirect: redirect::Policy,
    cookie_store: Option<Arc<dyn CookieStore>>,
    root_certs: Vec<Certificate>,
    danger_accept_invalid_certs: bool,
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder::new()
    }
}

impl ClientBuilder {
    /// Constructs a new `ClientBuilder`.
    ///
    /// This is the same as `Client::builder()`.
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            config: Config {
                proxy: None,
                pool_max_per_host: 4,
                pool_acquire_timeout: None,
                send_timeout: None,
                recv_timeout: None,
                redirect: redirect::Policy::default(),
                cookie_store: None,
                root_certs: Vec::new(),
                danger_accept_invalid_certs: false,
            },
        }
    }

    /// Set the proxy every request is tunnelled through. Required.
    pub fn proxy(mut self, proxy: Proxy) -> ClientBuilder {
        self.config.proxy = Some(proxy);
        self
    }

    /// Maximum number of tunnels kept per destination host. Defaults to 4.
    pub fn pool_max_per_host(mut self, max: usize) -> ClientBuilder {
        self.config.pool_max_per_host = max;
        self
    }

    /// How long a request may wait for a free pooled tunnel before failing
    /// with a pool-timeout error. No limit by default.
    pub fn pool_acquire_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.pool_acquire_timeout = Some(timeout);
        self
    }

    /// Per-operation timeout for socket writes, including the proxy
    /// handshake requests.
    pub fn send_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.send_timeout = Some(timeout);
        self
    }

    /// Per-operation timeout for socket reads.
    pub fn recv_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.recv_timeout = Some(timeout);
        self
    }

    /// Set the redirect policy. Defaults to following up to 10 redirects.
    pub fn redirect(mut self, policy: redirect::Policy) -> ClientBuilder {
        self.config.redirect = policy;
        self
    }

    /// Enable (or disable) an in-memory cookie store.
    pub fn cookie_store(mut self, enable: bool) -> ClientBuilder {
        self.config.cookie_store = if enable {
            Some(Arc::new(crate::cookie::Jar::default()))
        } else {
            None
        };
        self
    }

    /// Use a caller-provided cookie store.
    pub fn cookie_provider(mut self, store: Arc<dyn CookieStore>) -> ClientBuilder {
        self.config.cookie_store = Some(store);
        self
    }

    /// Add a custom root certificate, for destinations with self-signed or
    /// private-CA certificates.
    pub fn add_root_certificate(mut self, cert: Certificate) -> ClientBuilder {
        self.config.root_certs.push(cert);
        self
    }

    /// Disable TLS certificate verification.
    ///
    /// # Warning
    ///
    /// Anyone positioned between this client and the proxy (or the proxy
    /// itself) can impersonate the destination.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> ClientBuilder {
        self.config.danger_accept_invalid_certs = accept;
        self
    }

    /// Returns a `Client` that uses this `ClientBuilder` configuration.
    ///
    /// # Errors
    ///
    /// Fails if no proxy was configured, the proxy endpoint is invalid, or
    /// the TLS backend cannot be initialized.
    pub fn build(self) -> crate::Result<Client> {
        let config = self.config;
        let proxy = config
            .proxy
            .ok_or_else(|| error::builder("a proxy is required to build this client"))?;
        proxy.validate()?;
        if config.pool_max_per_host == 0 {
            return Err(error::builder("pool_max_per_host must be at least 1"));
        }
        let tls = tls::client_config(&config.root_certs, config.danger_accept_invalid_certs)?;
        let connector = Arc::new(ProxyConnector::new(
            proxy,
            config.send_timeout,
            config.recv_timeout,
        ));
        Ok(Client {
            inner: Arc::new(ClientInner {
                connector,
                tls,
                pools: RwLock::new(HashMap::new()),
                pool_max_per_host: config.pool_max_per_host,
                pool_acquire_timeout: config.pool_acquire_timeout,
                send_timeout: config.send_timeout,
                recv_timeout: config.recv_timeout,
                redirect: config.redirect,
                cookie_store: config.cookie_store,
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("proxy", &self.proxy)
            .field("pool_max_per_host", &self.pool_max_per_host)
            .field("redirect", &self.redirect)
            .finish()
    }
}
