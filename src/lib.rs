//! # culvert
//!
//! An HTTP/1.x client that tunnels every request through an upstream proxy
//! server, speaking HTTP CONNECT, SOCKS4, SOCKS4a or SOCKS5 on the way out.
//!
//! The [`Client`] replaces a direct TCP/TLS connection with a
//! proxy-negotiated tunnel and runs plain HTTP/1.x over it: callers submit
//! logical requests and get logical responses back, unaware of the
//! tunnelling. Tunnels are pooled per destination host and reused across
//! requests whose responses were read to completion.
//!
//! - Transparent gzip and deflate response decoding
//! - Chunked and content-length body framing
//! - Redirect following with the browser method-rewrite rules
//! - Optional cookie store
//! - TLS to the destination through the tunnel (rustls)
//!
//! ## Example
//!
//! ```no_run
//! # async fn run() -> Result<(), culvert::Error> {
//! use culvert::{Client, Proxy};
//!
//! let client = Client::builder()
//!     .proxy(Proxy::socks5("127.0.0.1").port(9050))
//!     .build()?;
//!
//! let resp = client.get("http://example.com/").send().await?;
//! println!("status: {}", resp.status());
//! println!("body: {}", resp.text().await?);
//! # Ok(())
//! # }
//! ```

pub use http::header;
pub use http::Method;
pub use http::StatusCode;
pub use http::Version;
pub use url::Url;

pub use self::body::Body;
pub use self::client::{Client, ClientBuilder};
pub use self::error::{Error, Result};
pub use self::into_url::IntoUrl;
pub use self::proxy::{Dialect, Proxy};
pub use self::request::{Request, RequestBuilder};
pub use self::response::Response;
pub use self::tls::Certificate;

mod body;
mod buffered;
mod client;
mod connect;
pub mod cookie;
mod error;
mod http1;
mod into_url;
mod pool;
mod proxy;
pub mod redirect;
mod request;
mod response;
mod tls;
mod util;
