//! Shared helpers for the relay integration tests

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::{sleep, timeout, Instant};

use init_proxyd::{Relay, RelayOptions, SocketKind};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// Start a TCP server that echoes every connection back until EOF
pub async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

/// Start a UDP server that answers each datagram with `<source>|<payload>`,
/// so tests can tell which outbound socket a datagram came through
pub async fn spawn_udp_tagger() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((n, source)) = socket.recv_from(&mut buf).await {
            let reply = format!("{}|{}", source, String::from_utf8_lossy(&buf[..n]));
            let _ = socket.send_to(reply.as_bytes(), source).await;
        }
    });
    addr
}

/// Build, but do not start, a stream relay on a fresh loopback listener
pub fn stream_relay(destination: &str, options: RelayOptions) -> (Relay, SocketAddr) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let relay =
        Relay::from_fd(OwnedFd::from(listener), SocketKind::Stream, destination, options).unwrap();
    (relay, addr)
}

/// Build, but do not start, a packet relay on a fresh loopback socket
pub fn packet_relay(destination: &str, options: RelayOptions) -> (Relay, SocketAddr) {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    let relay =
        Relay::from_fd(OwnedFd::from(socket), SocketKind::Packet, destination, options).unwrap();
    (relay, addr)
}

/// Send one datagram through the relay and wait for the tagged reply
pub async fn exchange(client: &UdpSocket, relay: SocketAddr, payload: &str) -> (String, String) {
    client.send_to(payload.as_bytes(), relay).await.unwrap();
    let mut buf = vec![0u8; 2048];
    let (n, _) = timeout(WAIT, client.recv_from(&mut buf))
        .await
        .expect("timed out waiting for reply")
        .unwrap();
    let reply = String::from_utf8_lossy(&buf[..n]).into_owned();
    let (tag, echoed) = reply.split_once('|').expect("reply without tag");
    (tag.to_string(), echoed.to_string())
}

/// Read from a stream until EOF, failing the test if it takes too long
pub async fn read_to_end<R: AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
    let mut received = Vec::new();
    timeout(WAIT, reader.read_to_end(&mut received))
        .await
        .expect("timed out waiting for EOF")
        .unwrap();
    received
}

/// Poll `condition` until it holds or the wait bound passes
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await `future`, failing the test if it takes too long
pub async fn within<F: Future>(future: F) -> F::Output {
    timeout(WAIT, future).await.expect("timed out")
}
