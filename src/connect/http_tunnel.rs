//! HTTP `CONNECT` tunnelling.

use base64::prelude::{Engine, BASE64_STANDARD};

use super::ProxyIo;
use crate::error;

pub(crate) async fn handshake(
    io: &mut ProxyIo<'_>,
    host: &str,
    port: u16,
    auth: Option<(&str, &str)>,
) -> crate::Result<()> {
    let mut request = format!("CONNECT {host}:{port} HTTP/1.0\r\nHost: {host}:{port}\r\n");
    if let Some((user, pass)) = auth {
        let credentials = BASE64_STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");
    io.write_all(request.as_bytes()).await?;

    // Read the response head byte by byte up to the blank line and no
    // further: anything past it already belongs to the tunnel.
    let mut head: Vec<u8> = Vec::new();
    loop {
        match io.read_byte().await? {
            Some(byte) => head.push(byte),
            None => {
                return Err(error::proxy(
                    "proxy closed the connection during CONNECT",
                ))
            }
        }
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.split("\r\n").next().unwrap_or("");
    let (code, reason) = parse_status_line(status_line)?;
    match code {
        200 => Ok(()),
        502 => Err(error::proxy(format!(
            "proxy could not reach {host}:{port}: 502 Bad Gateway"
        ))),
        _ => Err(error::proxy(format!(
            "proxy CONNECT refused: {code} {reason}"
        ))),
    }
}

fn parse_status_line(line: &str) -> crate::Result<(u16, String)> {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some(version) if version.starts_with("HTTP") => {}
        _ => {
            return Err(error::proxy(format!(
                "unexpected response from proxy: {line:?}"
            )))
        }
    }
    let code = parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| error::proxy(format!("unexpected response from proxy: {line:?}")))?;
    let reason = parts.collect::<Vec<_>>().join(" ");
    Ok((code, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ok_status() {
        let (code, reason) = parse_status_line("HTTP/1.1 200 Connection established").unwrap();
        assert_eq!(code, 200);
        assert_eq!(reason, "Connection established");
    }

    #[test]
    fn parses_status_without_reason() {
        let (code, reason) = parse_status_line("HTTP/1.0 200").unwrap();
        assert_eq!(code, 200);
        assert_eq!(reason, "");
    }

    #[test]
    fn rejects_missing_http_token() {
        assert!(parse_status_line("SSH-2.0-OpenSSH").unwrap_err().is_proxy());
    }

    #[test]
    fn rejects_unparseable_code() {
        assert!(parse_status_line("HTTP/1.1 abc OK").unwrap_err().is_proxy());
    }
}
