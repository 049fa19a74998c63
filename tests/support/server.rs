//! A scripted byte-level TCP server standing in for the upstream proxy.
//!
//! Proxy handshakes are binary and byte-exact, so instead of an HTTP
//! server the tests drive a script per accepted connection: read this many
//! bytes, reply with those bytes, wait, close. Everything read is recorded
//! for the test to assert on afterwards.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub enum Action {
    /// Read exactly this many bytes and record them.
    Expect(usize),
    /// Read one HTTP request head (through the blank line) plus its
    /// `Content-Length` body, and record it.
    ExpectHead,
    /// Write these bytes to the client.
    Reply(Vec<u8>),
    /// Sleep before the next action.
    Wait(Duration),
}

pub fn expect(len: usize) -> Action {
    Action::Expect(len)
}

pub fn expect_head() -> Action {
    Action::ExpectHead
}

pub fn reply(bytes: impl Into<Vec<u8>>) -> Action {
    Action::Reply(bytes.into())
}

pub fn wait(dur: Duration) -> Action {
    Action::Wait(dur)
}

pub struct Server {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Server {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Everything the scripts read so far, in read order.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    /// Like `received`, lossily decoded for HTTP-head assertions.
    pub fn received_text(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }
}

/// Spawn a server that accepts one connection per script, in order, and
/// runs each connection's actions to completion before closing it.
pub async fn script(connections: Vec<Vec<Action>>) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    tokio::spawn(async move {
        for actions in connections {
            let Ok((sock, _)) = listener.accept().await else {
                return;
            };
            let log = log.clone();
            tokio::spawn(async move {
                run_script(sock, actions, log).await;
            });
        }
    });
    Server { addr, received }
}

async fn run_script(mut sock: TcpStream, actions: Vec<Action>, log: Arc<Mutex<Vec<Vec<u8>>>>) {
    for action in actions {
        match action {
            Action::Expect(len) => {
                let mut buf = vec![0u8; len];
                if sock.read_exact(&mut buf).await.is_err() {
                    return;
                }
                log.lock().unwrap().push(buf);
            }
            Action::ExpectHead => {
                let Some(head) = read_request(&mut sock).await else {
                    return;
                };
                log.lock().unwrap().push(head);
            }
            Action::Reply(bytes) => {
                if sock.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            Action::Wait(dur) => tokio::time::sleep(dur).await,
        }
    }
}

/// Read an HTTP request head byte by byte, then its body when a
/// `Content-Length` is present.
async fn read_request(sock: &mut TcpStream) -> Option<Vec<u8>> {
    let mut head: Vec<u8> = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        if sock.read_exact(&mut byte).await.is_err() {
            return None;
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&head).into_owned();
    let content_length = text
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        if sock.read_exact(&mut body).await.is_err() {
            return None;
        }
        head.extend_from_slice(&body);
    }
    Some(head)
}
