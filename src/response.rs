use std::fmt;

use bytes::Bytes;
use http::header::{HeaderMap, CONTENT_LENGTH};
use http::{StatusCode, Version};
use tokio::io::AsyncReadExt;
use url::Url;

use crate::body::Body;

/// A Response to a submitted `Request`.
pub struct Response {
    url: Url,
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Body,
}

impl Response {
    pub(crate) fn new(
        url: Url,
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        body: Body,
    ) -> Response {
        Response {
            url,
            status,
            version,
            headers,
            body,
        }
    }

    /// Get the `StatusCode` of this `Response`.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP `Version` of this `Response`.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the `Headers` of this `Response`.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get the final `Url` of this `Response`, after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the declared length of the response body, if any.
    ///
    /// Bodies served with chunked framing or closed-delimited framing have
    /// no declared length.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Stream one piece of the body, or `None` once it is exhausted.
    pub async fn chunk(&mut self) -> crate::Result<Option<Bytes>> {
        let mut buf = vec![0u8; 8 * 1024];
        let n = self
            .body
            .read(&mut buf)
            .await
            .map_err(crate::error::body_io)?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }

    /// Read the full response body as `Bytes`.
    pub async fn bytes(mut self) -> crate::Result<Bytes> {
        let mut out = Vec::new();
        self.body
            .read_to_end(&mut out)
            .await
            .map_err(crate::error::body_io)?;
        Ok(Bytes::from(out))
    }

    /// Read the full response body as text.
    pub async fn text(self) -> crate::Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url)
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}
