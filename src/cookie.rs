//! HTTP Cookies

use std::fmt;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use http::header::HeaderValue;
use url::Url;

/// Actions for a persistent cookie store providing session support.
pub trait CookieStore: Send + Sync {
    /// Store a set of Set-Cookie header values received from `url`.
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url);
    /// Get any Cookie values in the store for `url`.
    fn cookies(&self, url: &Url) -> Option<HeaderValue>;
}

/// A good default `CookieStore` implementation.
///
/// This is the implementation used when simply calling `cookie_store(true)`
/// on the client builder. This type is exposed to allow creating one and
/// filling it with some existing cookies more easily, before creating a
/// `Client`.
#[derive(Default)]
pub struct Jar(RwLock<Vec<StoredCookie>>);

struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    path: String,
    port: Option<String>,
    secure: bool,
    http_only: bool,
    discard: bool,
    expires: Option<SystemTime>,
}

impl StoredCookie {
    fn expired(&self, now: SystemTime) -> bool {
        self.expires.map(|when| when <= now).unwrap_or(false)
    }

    /// Should this cookie travel on a request to `url`?
    fn matches(&self, url: &Url, now: SystemTime) -> bool {
        if self.expired(now) {
            return false;
        }
        if url.host_str() != Some(self.domain.as_str()) {
            return false;
        }
        if !url.path().starts_with(&self.path) {
            return false;
        }
        if self.secure && url.scheme() != "https" {
            return false;
        }
        if let Some(ref ports) = self.port {
            let request_port = url.port_or_known_default();
            let allowed = ports
                .split(',')
                .filter_map(|p| p.trim().trim_matches('"').parse::<u16>().ok())
                .any(|p| Some(p) == request_port);
            if !allowed {
                return false;
            }
        }
        true
    }
}

impl fmt::Debug for StoredCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie")
            .field("name", &self.name)
            .field("value", &self.value)
            .field("domain", &self.domain)
            .field("path", &self.path)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("http_only", &self.http_only)
            .field("discard", &self.discard)
            .field("expires", &self.expires)
            .finish()
    }
}

/// One parsed `Set-Cookie` header value.
#[derive(Debug, Default)]
pub(crate) struct SetCookie {
    pub(crate) name: String,
    pub(crate) value: String,
    pub(crate) path: Option<String>,
    pub(crate) port: Option<String>,
    pub(crate) secure: bool,
    pub(crate) http_only: bool,
    pub(crate) discard: bool,
    pub(crate) expires: Option<SystemTime>,
    pub(crate) max_age: Option<i64>,
}

impl SetCookie {
    /// `Expires` wins over `Max-Age`; `Max-Age` counts from `now` and may
    /// be negative.
    pub(crate) fn effective_expiry(&self, now: SystemTime) -> Option<SystemTime> {
        if let Some(expires) = self.expires {
            return Some(expires);
        }
        self.max_age.map(|secs| {
            if secs >= 0 {
                now + Duration::from_secs(secs as u64)
            } else {
                now - Duration::from_secs(secs.unsigned_abs())
            }
        })
    }
}

/// Parse one `Set-Cookie` value: `name=value` followed by `;`-separated
/// attributes with case-insensitive names.
pub(crate) fn parse_set_cookie(header: &str) -> Option<SetCookie> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let mut cookie = SetCookie {
        name: name.to_owned(),
        value: value.trim().to_owned(),
        ..SetCookie::default()
    };
    for attr in parts {
        match attr.split_once('=') {
            Some((key, val)) => {
                let val = val.trim();
                match key.trim().to_ascii_lowercase().as_str() {
                    "expires" => cookie.expires = httpdate::parse_http_date(val).ok(),
                    "max-age" => cookie.max_age = val.parse::<i64>().ok(),
                    "path" => cookie.path = Some(val.to_owned()),
                    "port" => cookie.port = Some(val.to_owned()),
                    _ => {}
                }
            }
            None => match attr.trim().to_ascii_lowercase().as_str() {
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "discard" => cookie.discard = true,
                _ => {}
            },
        }
    }
    Some(cookie)
}

impl Jar {
    /// Add a cookie to this jar, as if `cookie` had arrived in a
    /// `Set-Cookie` header from `url`.
    ///
    /// # Example
    ///
    /// ```
    /// use culvert::cookie::Jar;
    /// use culvert::Url;
    ///
    /// let url = "https://example.com".parse::<Url>().unwrap();
    /// let jar = Jar::default();
    /// jar.add_cookie_str("session=abc123; Path=/", &url);
    /// ```
    pub fn add_cookie_str(&self, cookie: &str, url: &Url) {
        self.store_one(cookie, url, SystemTime::now());
    }

    fn store_one(&self, header: &str, url: &Url, now: SystemTime) {
        let Some(host) = url.host_str() else { return };
        let Some(parsed) = parse_set_cookie(header) else {
            return;
        };
        let mut store = self.0.write().unwrap();
        let expiry = parsed.effective_expiry(now);
        if let Some(when) = expiry {
            if when <= now {
                // an already-expired cookie erases its namesake rather
                // than being stored
                store.retain(|c| !(c.name == parsed.name && c.domain == host));
                return;
            }
        }
        let cookie = StoredCookie {
            name: parsed.name,
            value: parsed.value,
            domain: host.to_owned(),
            path: parsed.path.unwrap_or_else(|| "/".to_owned()),
            port: parsed.port,
            // over https every stored cookie is secure
            secure: parsed.secure || url.scheme() == "https",
            http_only: parsed.http_only,
            discard: parsed.discard,
            expires: expiry,
        };
        store.retain(|c| {
            !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
        });
        store.push(cookie);
    }
}

impl CookieStore for Jar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let now = SystemTime::now();
        for header in cookie_headers {
            if let Ok(text) = header.to_str() {
                self.store_one(text, url, now);
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let now = SystemTime::now();
        let store = self.0.read().unwrap();
        let line = store
            .iter()
            .filter(|cookie| cookie.matches(url, now))
            .map(|cookie| format!("{}={};", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join(" ");
        if line.is_empty() {
            return None;
        }
        HeaderValue::from_str(&line).ok()
    }
}

impl fmt::Debug for Jar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jar")
            .field("cookies", &*self.0.read().unwrap())
            .finish()
    }
}
