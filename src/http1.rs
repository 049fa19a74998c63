//! HTTP/1.x over the tunnel: request serialization and response head
//! parsing, with resolution of the response body framing.

use std::time::Duration;

use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, COOKIE, HOST,
    SET_COOKIE, TRANSFER_ENCODING,
};
use http::{Method, StatusCode, Version};
use tokio::io::AsyncRead;

use crate::body::{Coding, Framing};
use crate::buffered::BufferedStream;
use crate::error;
use crate::request::Request;
use crate::util;

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    /// `Set-Cookie` values are routed to the cookie store, never into the
    /// response headers.
    pub(crate) set_cookies: Vec<HeaderValue>,
}

/// Serialize the request head (and trailing blank line) as raw bytes.
///
/// A `Host` header is synthesized from the URL when absent, a
/// `Content-Length` from the body when absent, and `cookie_header` is
/// attached unless the caller already set one.
pub(crate) fn serialize_request(req: &Request, cookie_header: Option<HeaderValue>) -> Vec<u8> {
    let url = req.url();
    let version = match req.version() {
        Version::HTTP_10 => "1.0",
        _ => "1.1",
    };
    let mut target = url.path().to_owned();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut buf: Vec<u8> = Vec::with_capacity(256);
    buf.extend_from_slice(format!("{} {} HTTP/{}\r\n", req.method(), target, version).as_bytes());

    if !req.headers().contains_key(HOST) {
        let mut authority = url.host_str().unwrap_or("").to_owned();
        if let Some(port) = url.port() {
            authority.push(':');
            authority.push_str(&port.to_string());
        }
        buf.extend_from_slice(format!("Host: {authority}\r\n").as_bytes());
    }

    for (name, value) in req.headers() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if let Some(body) = req.body() {
        if !req.headers().contains_key(CONTENT_LENGTH) {
            buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
    }

    if let Some(cookies) = cookie_header {
        if !req.headers().contains_key(COOKIE) {
            buf.extend_from_slice(b"Cookie: ");
            buf.extend_from_slice(cookies.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }

    buf.extend_from_slice(b"\r\n");
    buf
}

/// Read and parse the status line and header block.
pub(crate) async fn read_head<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
    recv_timeout: Option<Duration>,
) -> crate::Result<ResponseHead> {
    // wait for the first response bytes under the receive deadline
    let arrived = util::timed(recv_timeout, stream.ensure_buffered(1))
        .await
        .map_err(error::io)?;
    if !arrived {
        return Err(error::io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before the status line",
        )));
    }
    let status_line = util::timed(recv_timeout, stream.read_line())
        .await
        .map_err(error::io)?;
    let (version, status) = parse_status_line(&status_line)?;

    let mut headers = HeaderMap::new();
    let mut set_cookies = Vec::new();
    loop {
        let line = util::timed(recv_timeout, stream.read_line())
            .await
            .map_err(error::io)?;
        if line.is_empty() {
            break;
        }
        let (name, value) = parse_header_line(&line)?;
        if name == SET_COOKIE {
            set_cookies.push(value);
        } else {
            headers.append(name, value);
        }
    }

    Ok(ResponseHead {
        version,
        status,
        headers,
        set_cookies,
    })
}

fn parse_status_line(line: &str) -> crate::Result<(Version, StatusCode)> {
    let mut parts = line.splitn(3, ' ');
    let proto = parts.next().unwrap_or("");
    let code = parts
        .next()
        .ok_or_else(|| error::protocol(format!("malformed status line: {line:?}")))?;
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| error::protocol(format!("malformed status line: {line:?}")))?;
    let version = match proto {
        "HTTP/1.0" => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    Ok((version, status))
}

/// Split a header line at the first colon. The value starts after the
/// colon, with one leading space (the conventional separator) skipped; any
/// further whitespace is part of the value.
fn parse_header_line(line: &str) -> crate::Result<(HeaderName, HeaderValue)> {
    let (name, rest) = line
        .split_once(':')
        .ok_or_else(|| error::protocol(format!("invalid header line: {line:?}")))?;
    let value = rest.strip_prefix(' ').unwrap_or(rest);
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| error::protocol(format!("invalid header name: {name:?}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| error::protocol(format!("invalid header value: {value:?}")))?;
    Ok((name, value))
}

/// Determine how the response body ends.
pub(crate) fn body_framing(method: &Method, head: &ResponseHead) -> crate::Result<Framing> {
    if method == Method::HEAD
        || head.status.is_informational()
        || matches!(head.status.as_u16(), 204 | 304)
    {
        return Ok(Framing::Empty);
    }
    if let Some(te) = head.headers.get(TRANSFER_ENCODING) {
        let chunked = te
            .to_str()
            .map(|value| value.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        if chunked {
            return Ok(Framing::chunked());
        }
    }
    if let Some(cl) = head.headers.get(CONTENT_LENGTH) {
        let length = cl
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| error::protocol("invalid Content-Length header"))?;
        return Ok(Framing::Length(length));
    }
    Ok(Framing::Close)
}

/// Pick the transparent decoding for the body, stripping the
/// `Content-Encoding` header when one applies.
pub(crate) fn content_coding(headers: &mut HeaderMap) -> Option<Coding> {
    let coding = match headers.get(CONTENT_ENCODING) {
        Some(value) => match value.to_str() {
            Ok(text) => match text.trim().to_ascii_lowercase().as_str() {
                "gzip" => Coding::Gzip,
                "deflate" => Coding::Deflate,
                _ => return None,
            },
            Err(_) => return None,
        },
        None => return None,
    };
    headers.remove(CONTENT_ENCODING);
    Some(coding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn request(method: Method, url: &str) -> Request {
        Request::new(method, Url::parse(url).unwrap())
    }

    #[test]
    fn serializes_get_with_host_and_query() {
        let req = request(Method::GET, "http://example.com/a/b?x=1");
        let bytes = serialize_request(&req, None);
        assert_eq!(
            bytes,
            b"GET /a/b?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn serializes_explicit_port_in_host() {
        let req = request(Method::GET, "http://example.com:8080/");
        let bytes = serialize_request(&req, None);
        assert!(bytes.starts_with(b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n"));
    }

    #[test]
    fn serializes_body_with_content_length() {
        let mut req = request(Method::POST, "http://h/submit");
        *req.body_mut() = Some(bytes::Bytes::from_static(b"abc"));
        let text = String::from_utf8(serialize_request(&req, None)).unwrap();
        assert!(text.contains("Content-Length: 3\r\n"), "{text}");
    }

    #[test]
    fn keeps_caller_content_length() {
        let mut req = request(Method::POST, "http://h/submit");
        *req.body_mut() = Some(bytes::Bytes::from_static(b"abc"));
        req.headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from_static("3"));
        let text = String::from_utf8(serialize_request(&req, None)).unwrap();
        assert_eq!(text.matches("ontent-").count(), 1, "{text}");
    }

    #[test]
    fn serializes_multi_value_headers_one_line_each() {
        let mut req = request(Method::GET, "http://h/");
        req.headers_mut()
            .append("x-tag", HeaderValue::from_static("one"));
        req.headers_mut()
            .append("x-tag", HeaderValue::from_static("two"));
        let text = String::from_utf8(serialize_request(&req, None)).unwrap();
        assert!(text.contains("x-tag: one\r\n"), "{text}");
        assert!(text.contains("x-tag: two\r\n"), "{text}");
    }

    #[test]
    fn attaches_cookie_header() {
        let req = request(Method::GET, "http://h/");
        let text = String::from_utf8(serialize_request(
            &req,
            Some(HeaderValue::from_static("a=1; b=2;")),
        ))
        .unwrap();
        assert!(text.contains("Cookie: a=1; b=2;\r\n"), "{text}");
    }

    #[test]
    fn http_10_request_line() {
        let mut req = request(Method::GET, "http://h/");
        *req.version_mut() = Version::HTTP_10;
        let bytes = serialize_request(&req, None);
        assert!(bytes.starts_with(b"GET / HTTP/1.0\r\n"));
    }

    #[tokio::test]
    async fn reads_head_with_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-N: 1\r\n\r\nrest";
        let mut stream = BufferedStream::new(&raw[..]);
        let head = read_head(&mut stream, None).await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers["content-type"], "text/plain");
        assert_eq!(head.headers["x-n"], "1");
    }

    #[tokio::test]
    async fn routes_set_cookie_away_from_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1; Path=/\r\nX-N: 1\r\n\r\n";
        let mut stream = BufferedStream::new(&raw[..]);
        let head = read_head(&mut stream, None).await.unwrap();
        assert!(head.headers.get(SET_COOKIE).is_none());
        assert_eq!(head.set_cookies.len(), 1);
        assert_eq!(head.set_cookies[0], "a=1; Path=/");
    }

    #[tokio::test]
    async fn header_value_without_space_keeps_first_char() {
        let raw = b"HTTP/1.1 200 OK\r\nX-N:value\r\nX-M:  padded\r\n\r\n";
        let mut stream = BufferedStream::new(&raw[..]);
        let head = read_head(&mut stream, None).await.unwrap();
        assert_eq!(head.headers["x-n"], "value");
        // only the single separator space is skipped
        assert_eq!(head.headers["x-m"], " padded");
    }

    #[tokio::test]
    async fn rejects_header_line_without_colon() {
        let raw = b"HTTP/1.1 200 OK\r\nnot a header\r\n\r\n";
        let mut stream = BufferedStream::new(&raw[..]);
        let err = read_head(&mut stream, None).await.unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn rejects_malformed_status_line() {
        let mut stream = BufferedStream::new(&b"garbage\r\n\r\n"[..]);
        let err = read_head(&mut stream, None).await.unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn reason_phrase_is_optional() {
        let mut stream = BufferedStream::new(&b"HTTP/1.1 204\r\n\r\n"[..]);
        let head = read_head(&mut stream, None).await.unwrap();
        assert_eq!(head.status, StatusCode::NO_CONTENT);
    }

    fn head_with(headers: &[(&str, &str)], status: StatusCode) -> ResponseHead {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        ResponseHead {
            version: Version::HTTP_11,
            status,
            headers: map,
            set_cookies: Vec::new(),
        }
    }

    #[test]
    fn framing_prefers_chunked() {
        let head = head_with(
            &[("transfer-encoding", "chunked"), ("content-length", "5")],
            StatusCode::OK,
        );
        assert!(matches!(
            body_framing(&Method::GET, &head).unwrap(),
            Framing::Chunked(_)
        ));
    }

    #[test]
    fn framing_content_length() {
        let head = head_with(&[("content-length", "42")], StatusCode::OK);
        assert!(matches!(
            body_framing(&Method::GET, &head).unwrap(),
            Framing::Length(42)
        ));
    }

    #[test]
    fn framing_invalid_content_length_is_protocol_error() {
        let head = head_with(&[("content-length", "abc")], StatusCode::OK);
        assert!(body_framing(&Method::GET, &head).unwrap_err().is_protocol());
    }

    #[test]
    fn framing_defaults_to_close() {
        let head = head_with(&[], StatusCode::OK);
        assert!(matches!(
            body_framing(&Method::GET, &head).unwrap(),
            Framing::Close
        ));
    }

    #[test]
    fn framing_empty_for_head_and_no_content() {
        let head = head_with(&[("content-length", "10")], StatusCode::OK);
        assert!(matches!(
            body_framing(&Method::HEAD, &head).unwrap(),
            Framing::Empty
        ));
        let head = head_with(&[], StatusCode::NO_CONTENT);
        assert!(matches!(
            body_framing(&Method::GET, &head).unwrap(),
            Framing::Empty
        ));
    }

    #[test]
    fn coding_detection_strips_header() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("GZip"));
        assert_eq!(content_coding(&mut headers), Some(Coding::Gzip));
        assert!(headers.get(CONTENT_ENCODING).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("deflate"));
        assert_eq!(content_coding(&mut headers), Some(Coding::Deflate));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        assert_eq!(content_coding(&mut headers), None);
        assert!(headers.get(CONTENT_ENCODING).is_some());
    }
}
