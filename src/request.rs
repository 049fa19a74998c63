use std::fmt;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Version};
use url::Url;

use crate::client::Client;
use crate::response::Response;

/// A request which can be executed with `Client::execute()`.
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
    version: Version,
}

impl Request {
    /// Constructs a new request.
    pub fn new(method: Method, url: Url) -> Request {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            version: Version::HTTP_11,
        }
    }

    /// Get the method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get a mutable reference to the method.
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    /// Get the url.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get a mutable reference to the url.
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Get the headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the body.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Get a mutable reference to the body.
    pub fn body_mut(&mut self) -> &mut Option<Bytes> {
        &mut self.body
    }

    /// Get the HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get a mutable reference to the HTTP version.
    pub fn version_mut(&mut self) -> &mut Version {
        &mut self.version
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .finish()
    }
}

/// A builder to construct the properties of a `Request`.
///
/// Obtained through [`Client::get`], [`Client::post`] and friends; errors
/// from the individual setters are deferred until [`send`](RequestBuilder::send).
pub struct RequestBuilder {
    client: Client,
    request: crate::Result<Request>,
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, request: crate::Result<Request>) -> RequestBuilder {
        RequestBuilder { client, request }
    }

    /// Add a header to this request.
    pub fn header<K, V>(mut self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match <HeaderName as TryFrom<K>>::try_from(key) {
                Ok(key) => match <HeaderValue as TryFrom<V>>::try_from(value) {
                    Ok(value) => {
                        req.headers_mut().append(key, value);
                    }
                    Err(e) => error = Some(crate::error::builder(e.into())),
                },
                Err(e) => error = Some(crate::error::builder(e.into())),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Enable HTTP basic authentication.
    pub fn basic_auth<U, P>(self, username: U, password: Option<P>) -> RequestBuilder
    where
        U: fmt::Display,
        P: fmt::Display,
    {
        let header = basic_auth_value(username, password);
        self.header(http::header::AUTHORIZATION, header)
    }

    /// Set the request body.
    pub fn body<B: Into<Bytes>>(mut self, body: B) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = Some(body.into());
        }
        self
    }

    /// Set the HTTP version for this request.
    pub fn version(mut self, version: Version) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.version_mut() = version;
        }
        self
    }

    /// Build the `Request`.
    pub fn build(self) -> crate::Result<Request> {
        self.request
    }

    /// Constructs the request and sends it through the client's tunnel.
    pub async fn send(self) -> crate::Result<Response> {
        self.client.execute(self.request?).await
    }
}

/// `Basic <base64(user:pass)>`, marked sensitive so the credentials never
/// show up in debug output. A missing password still gets the colon, per
/// RFC 7617.
fn basic_auth_value<U, P>(username: U, password: Option<P>) -> HeaderValue
where
    U: fmt::Display,
    P: fmt::Display,
{
    use base64::prelude::{Engine, BASE64_STANDARD};

    let credentials = match password {
        Some(password) => format!("{username}:{password}"),
        None => format!("{username}:"),
    };
    let mut header = HeaderValue::try_from(format!("Basic {}", BASE64_STANDARD.encode(credentials)))
        .expect("base64 output is always a valid header value");
    header.set_sensitive(true);
    header
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("RequestBuilder");
        match self.request {
            Ok(ref req) => builder
                .field("method", req.method())
                .field("url", req.url())
                .finish(),
            Err(ref err) => builder.field("error", err).finish(),
        }
    }
}
