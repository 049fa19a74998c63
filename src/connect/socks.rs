//! SOCKS4, SOCKS4a and SOCKS5 client handshakes.
//!
//! SOCKS4 resolves the destination locally and sends its IPv4 address;
//! SOCKS4a signals proxy-side resolution with the dummy address 0.0.0.1 and
//! appends the hostname. SOCKS5 follows RFC 1928 with the CONNECT command
//! and optional username/password subnegotiation (RFC 1929).

use std::net::{Ipv4Addr, Ipv6Addr};

use super::ProxyIo;
use crate::error;

const SOCKS4_VERSION: u8 = 4;
const SOCKS5_VERSION: u8 = 5;
const CMD_CONNECT: u8 = 1;

const SOCKS4_GRANTED: u8 = 90;

const AUTH_NONE: u8 = 0x00;
const AUTH_USER_PASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub(crate) async fn socks4_handshake(
    io: &mut ProxyIo<'_>,
    host: &str,
    port: u16,
    userid: &str,
    remote_dns: bool,
) -> crate::Result<()> {
    let ip = if remote_dns {
        // 0.0.0.x with x != 0 tells the proxy to resolve the appended host
        Ipv4Addr::new(0, 0, 0, 1)
    } else {
        resolve_v4(host, port).await?
    };
    let frame = socks4_frame(ip.octets(), port, userid, remote_dns.then_some(host));
    io.write_all(&frame).await?;

    let mut reply = [0u8; 8];
    io.read_exact(&mut reply).await?;
    decode_socks4_reply(&reply)
}

async fn resolve_v4(host: &str, port: u16) -> crate::Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| error::proxy(format!("DNS resolve failed: {host}")))?;
    for addr in addrs {
        if let std::net::IpAddr::V4(ip) = addr.ip() {
            return Ok(ip);
        }
    }
    Err(error::proxy(format!("DNS resolve failed: {host}")))
}

/// `VN | CD | DSTPORT | DSTIP | USERID | NUL [| HOST | NUL]`
fn socks4_frame(ip: [u8; 4], port: u16, userid: &str, remote_host: Option<&str>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(10 + userid.len());
    frame.push(SOCKS4_VERSION);
    frame.push(CMD_CONNECT);
    frame.extend_from_slice(&port.to_be_bytes());
    frame.extend_from_slice(&ip);
    frame.extend_from_slice(userid.as_bytes());
    frame.push(0x00);
    if let Some(host) = remote_host {
        frame.extend_from_slice(host.as_bytes());
        frame.push(0x00);
    }
    frame
}

fn decode_socks4_reply(reply: &[u8; 8]) -> crate::Result<()> {
    let code = reply[1];
    if code == SOCKS4_GRANTED {
        return Ok(());
    }
    let reason = match code {
        91 => "request rejected or failed".to_owned(),
        92 => "request rejected because SOCKS server cannot connect to identd on the client"
            .to_owned(),
        93 => "request rejected because the client program and identd report different user-ids"
            .to_owned(),
        other => format!("unrecognized SOCKS4 reply code {other}"),
    };
    let addr = Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
    // The reported port keeps the original byte order quirk of this
    // client: bytes [3],[2] instead of the wire's big-endian [2],[3].
    // Diagnostic only; the protocol never consumes it.
    let port = u16::from_le_bytes([reply[2], reply[3]]);
    Err(error::proxy(format!(
        "SOCKS4 connect failed: {reason} (proxy reported {addr}:{port})"
    )))
}

pub(crate) async fn socks5_handshake(
    io: &mut ProxyIo<'_>,
    host: &str,
    port: u16,
    auth: Option<(&str, &str)>,
) -> crate::Result<()> {
    // method negotiation: always offer no-auth and username/password
    io.write_all(&[SOCKS5_VERSION, 2, AUTH_NONE, AUTH_USER_PASS])
        .await?;
    let mut choice = [0u8; 2];
    io.read_exact(&mut choice).await?;
    match choice[1] {
        AUTH_NONE => {}
        AUTH_USER_PASS => {
            let (user, pass) = auth.ok_or_else(|| {
                error::proxy("proxy requires username/password credentials")
            })?;
            io.write_all(&socks5_auth_frame(user, pass)?).await?;
            let mut status = [0u8; 2];
            io.read_exact(&mut status).await?;
            if status[1] != 0 {
                return Err(error::proxy("auth failure"));
            }
        }
        AUTH_NO_ACCEPTABLE => return Err(error::proxy("no acceptable auth methods")),
        other => {
            return Err(error::proxy(format!(
                "proxy selected unsupported auth method 0x{other:02x}"
            )))
        }
    }

    io.write_all(&socks5_connect_frame(host, port)?).await?;

    let mut reply = [0u8; 255];
    let n = io.read_some(&mut reply).await?;
    if n < 2 {
        return Err(error::proxy("truncated SOCKS5 reply"));
    }
    let rep = reply[1];
    if rep == 0 {
        return Ok(());
    }
    Err(error::proxy(format!(
        "SOCKS5 connect failed: {}; reply: {}",
        socks5_reply_text(rep),
        hex_dump(&reply[..n]),
    )))
}

/// `VER=1 | ULEN | UNAME | PLEN | PASSWD` (RFC 1929)
fn socks5_auth_frame(user: &str, pass: &str) -> crate::Result<Vec<u8>> {
    if user.len() > 255 || pass.len() > 255 {
        return Err(error::proxy(
            "proxy username and password must each be at most 255 bytes",
        ));
    }
    let mut frame = Vec::with_capacity(3 + user.len() + pass.len());
    frame.push(0x01);
    frame.push(user.len() as u8);
    frame.extend_from_slice(user.as_bytes());
    frame.push(pass.len() as u8);
    frame.extend_from_slice(pass.as_bytes());
    Ok(frame)
}

/// `VER | CMD=1 | RSV | ATYP | ADDR | PORT`
fn socks5_connect_frame(host: &str, port: u16) -> crate::Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(22 + host.len());
    frame.push(SOCKS5_VERSION);
    frame.push(CMD_CONNECT);
    frame.push(0x00);
    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        frame.push(ATYP_IPV4);
        frame.extend_from_slice(&v4.octets());
    } else if let Ok(v6) = host.parse::<Ipv6Addr>() {
        frame.push(ATYP_IPV6);
        frame.extend_from_slice(&v6.octets());
    } else {
        if host.len() > 255 || !host.is_ascii() {
            return Err(error::proxy(format!(
                "destination host not sendable over SOCKS5: {host}"
            )));
        }
        frame.push(ATYP_DOMAIN);
        frame.push(host.len() as u8);
        frame.extend_from_slice(host.as_bytes());
    }
    frame.extend_from_slice(&port.to_be_bytes());
    Ok(frame)
}

fn socks5_reply_text(rep: u8) -> &'static str {
    match rep {
        1 => "general SOCKS server failure",
        2 => "connection not allowed by ruleset",
        3 => "network unreachable",
        4 => "host unreachable",
        5 => "connection refused",
        6 => "TTL expired",
        7 => "command not supported",
        8 => "address type not supported",
        _ => "unknown reply",
    }
}

fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks4a_frame_for_example_com() {
        // CONNECT example.com:80, empty userid
        let frame = socks4_frame([0, 0, 0, 1], 80, "", Some("example.com"));
        assert_eq!(
            frame,
            [
                0x04, 0x01, 0x00, 0x50, 0x00, 0x00, 0x00, 0x01, 0x00, 0x65, 0x78, 0x61, 0x6D,
                0x70, 0x6C, 0x65, 0x2E, 0x63, 0x6F, 0x6D, 0x00,
            ]
        );
    }

    #[test]
    fn socks4_frame_with_userid() {
        let frame = socks4_frame([127, 0, 0, 1], 8080, "bob", None);
        assert_eq!(frame[..4], [0x04, 0x01, 0x1F, 0x90]);
        assert_eq!(frame[4..8], [127, 0, 0, 1]);
        assert_eq!(&frame[8..], b"bob\0");
    }

    #[test]
    fn socks4_reply_granted() {
        assert!(decode_socks4_reply(&[0, 90, 0, 80, 0, 0, 0, 0]).is_ok());
    }

    #[test]
    fn socks4_reject_reports_reversed_port() {
        // wire says port 80 (00 50, big-endian); the diagnostic keeps this
        // client's reversed assembly: 0x5000 = 20480
        let err = decode_socks4_reply(&[0, 91, 0x00, 0x50, 10, 0, 0, 1]).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("request rejected or failed"), "{text}");
        assert!(text.contains("10.0.0.1:20480"), "{text}");
    }

    #[test]
    fn socks4_unknown_reply_code() {
        let err = decode_socks4_reply(&[0, 17, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(err.to_string().contains("unrecognized SOCKS4 reply code 17"));
    }

    #[test]
    fn socks5_connect_frame_ipv4() {
        let frame = socks5_connect_frame("1.2.3.4", 443).unwrap();
        assert_eq!(frame, [0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x01, 0xBB]);
    }

    #[test]
    fn socks5_connect_frame_domain() {
        let frame = socks5_connect_frame("example.com", 80).unwrap();
        let mut expect = vec![0x05, 0x01, 0x00, 0x03, 11];
        expect.extend_from_slice(b"example.com");
        expect.extend_from_slice(&[0x00, 0x50]);
        assert_eq!(frame, expect);
    }

    #[test]
    fn socks5_connect_frame_ipv6() {
        let frame = socks5_connect_frame("::1", 80).unwrap();
        assert_eq!(frame[3], ATYP_IPV6);
        assert_eq!(frame.len(), 4 + 16 + 2);
    }

    #[test]
    fn socks5_connect_frame_rejects_long_domain() {
        let long = "a".repeat(256);
        assert!(socks5_connect_frame(&long, 80).unwrap_err().is_proxy());
    }

    #[test]
    fn socks5_auth_frame_layout() {
        let frame = socks5_auth_frame("foo", "bar").unwrap();
        assert_eq!(frame, [0x01, 3, b'f', b'o', b'o', 3, b'b', b'a', b'r']);
    }

    #[test]
    fn hex_dump_spacing() {
        assert_eq!(hex_dump(&[0x05, 0x01, 0xFF]), "05 01 FF");
    }
}
