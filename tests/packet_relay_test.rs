//! Integration tests for relaying datagram sockets through sessions

mod common;

use std::time::Duration;

use tokio::net::{UdpSocket, UnixDatagram};
use tokio::time::sleep;

use common::{eventually, exchange, packet_relay, spawn_udp_tagger, within, WAIT};
use init_proxyd::relay::Network;
use init_proxyd::{Relay, RelayOptions, SocketKind};

fn session_count(relay: &Relay) -> usize {
    match relay {
        Relay::Packet(relay) => relay.session_count(),
        Relay::Stream(_) => panic!("expected a packet relay"),
    }
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

#[tokio::test]
async fn test_session_reused_per_source() {
    let tagger = spawn_udp_tagger().await;
    let (relay, addr) = packet_relay(&format!(":{}", tagger.port()), RelayOptions::default());
    assert_eq!(relay.kind(), SocketKind::Packet);
    assert_eq!(relay.destination().network, Network::Udp);
    relay.start();

    let first = client().await;
    let (tag_a, echoed) = exchange(&first, addr, "one").await;
    assert_eq!(echoed, "one");
    let (tag_b, echoed) = exchange(&first, addr, "two").await;
    assert_eq!(echoed, "two");
    assert_eq!(tag_a, tag_b, "same source must reuse its session");

    // A second source gets its own outbound socket
    let second = client().await;
    let (tag_c, _) = exchange(&second, addr, "three").await;
    assert_ne!(tag_a, tag_c);

    assert_eq!(session_count(&relay), 2);
    assert!(eventually(|| relay.stats().bytes_up == 11).await);
    let stats = relay.stats();
    assert_eq!(stats.accepted, 3);
    assert_eq!(stats.sessions_created, 2);

    relay.close();
}

#[tokio::test]
async fn test_burst_from_one_source_opens_one_session() {
    let tagger = spawn_udp_tagger().await;
    let (relay, addr) = packet_relay(&tagger.to_string(), RelayOptions::default());
    relay.start();

    // Datagrams race each other to open the session
    let source = client().await;
    for i in 0..20 {
        source.send_to(format!("{}", i).as_bytes(), addr).await.unwrap();
    }

    let mut tags = Vec::new();
    let mut buf = vec![0u8; 512];
    while tags.len() < 20 {
        let (n, _) = within(source.recv_from(&mut buf)).await.unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]).into_owned();
        let (tag, _) = reply.split_once('|').unwrap();
        tags.push(tag.to_string());
    }

    tags.dedup();
    assert_eq!(tags.len(), 1);
    assert_eq!(session_count(&relay), 1);
    assert_eq!(relay.stats().sessions_created, 1);

    relay.close();
}

#[tokio::test]
async fn test_idle_session_expires() {
    let tagger = spawn_udp_tagger().await;
    let options = RelayOptions::new(Duration::from_millis(200), 0);
    let (relay, addr) = packet_relay(&tagger.to_string(), options);
    relay.start();

    let source = client().await;
    let (first_tag, _) = exchange(&source, addr, "hello").await;
    assert_eq!(session_count(&relay), 1);

    // Traffic keeps the session alive past its first deadline
    for _ in 0..4 {
        sleep(Duration::from_millis(100)).await;
        let (tag, _) = exchange(&source, addr, "still here").await;
        assert_eq!(tag, first_tag);
    }

    assert!(eventually(|| session_count(&relay) == 0).await);
    assert!(eventually(|| relay.stats().active == 0).await);

    // The next datagram opens a fresh session
    let (tag, echoed) = exchange(&source, addr, "again").await;
    assert_eq!(echoed, "again");
    assert_ne!(tag, first_tag);
    assert_eq!(relay.stats().sessions_created, 2);

    relay.close();
}

#[tokio::test]
async fn test_close_retires_sessions() {
    let tagger = spawn_udp_tagger().await;
    let options = RelayOptions::new(Duration::from_secs(60), 0);
    let (relay, addr) = packet_relay(&tagger.to_string(), options);
    relay.start();

    for _ in 0..3 {
        let source = client().await;
        exchange(&source, addr, "hi").await;
    }
    assert_eq!(session_count(&relay), 3);

    relay.close();
    relay.close();
    within(relay.stopped().wait()).await;

    // Sessions go long before their idle deadline
    assert!(eventually(|| session_count(&relay) == 0).await);
    assert!(eventually(|| relay.stats().active == 0).await);
}

#[tokio::test]
async fn test_dial_failure_keeps_relay_running() {
    let (relay, addr) = packet_relay(
        "unixgram:///nonexistent/init-proxyd.sock",
        RelayOptions::default(),
    );
    relay.start();

    let source = client().await;
    source.send_to(b"lost", addr).await.unwrap();

    assert!(eventually(|| relay.stats().dial_failures == 1).await);
    assert_eq!(session_count(&relay), 0);
    assert!(!relay.is_stopped());

    relay.close();
}

#[tokio::test]
async fn test_oversized_datagram_is_truncated_to_buffer() {
    let tagger = spawn_udp_tagger().await;
    let options = RelayOptions::new(Duration::from_secs(8), 8);
    let (relay, addr) = packet_relay(&tagger.to_string(), options);
    relay.start();

    let source = client().await;
    source.send_to(b"0123456789abcdef", addr).await.unwrap();

    // The reply is cut down to the buffer size on the way back as well
    let mut buf = vec![0u8; 64];
    let (n, _) = within(source.recv_from(&mut buf)).await.unwrap();
    assert_eq!(n, 8);
    assert!(eventually(|| relay.stats().bytes_up == 8).await);

    relay.close();
}

#[tokio::test]
async fn test_unixgram_source_to_udp_destination() {
    let tagger = spawn_udp_tagger().await;
    let dir = tempfile::tempdir().unwrap();
    let relay_path = dir.path().join("relay.sock");
    let client_path = dir.path().join("client.sock");

    let socket = std::os::unix::net::UnixDatagram::bind(&relay_path).unwrap();
    let relay = Relay::from_fd(
        socket.into(),
        SocketKind::Packet,
        &format!("udp://{}", tagger),
        RelayOptions::default(),
    )
    .unwrap();
    relay.start();

    let source = UnixDatagram::bind(&client_path).unwrap();
    source.send_to(b"from unix", &relay_path).await.unwrap();

    let mut buf = vec![0u8; 512];
    let n = tokio::time::timeout(WAIT, source.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let reply = String::from_utf8_lossy(&buf[..n]);
    assert!(reply.ends_with("|from unix"));

    relay.close();
}

/// Unix datagram relay towards the tagger, plus a bound client that sends
/// `count` datagrams and never reads the replies
async fn flood_without_reading(
    dir: &tempfile::TempDir,
    timeout: Duration,
    count: usize,
) -> (Relay, std::path::PathBuf, UnixDatagram) {
    let tagger = spawn_udp_tagger().await;
    let relay_path = dir.path().join("relay.sock");
    let socket = std::os::unix::net::UnixDatagram::bind(&relay_path).unwrap();
    let relay = Relay::from_fd(
        socket.into(),
        SocketKind::Packet,
        &format!("udp://{}", tagger),
        RelayOptions::new(timeout, 0),
    )
    .unwrap();
    relay.start();

    let source = UnixDatagram::bind(dir.path().join("client.sock")).unwrap();
    within(async {
        for i in 0..count {
            source
                .send_to(format!("{}", i).as_bytes(), &relay_path)
                .await
                .unwrap();
        }
    })
    .await;
    assert!(eventually(|| relay.stats().sessions_created == 1).await);

    (relay, relay_path, source)
}

#[tokio::test]
async fn test_session_expires_when_peer_stops_reading() {
    let dir = tempfile::tempdir().unwrap();
    let (relay, _, _source) = flood_without_reading(&dir, Duration::from_millis(300), 200).await;

    // Replies back up in the client's queue; the session must still go idle
    assert!(eventually(|| session_count(&relay) == 0).await);
    assert!(eventually(|| relay.stats().active == 0).await);

    relay.close();
}

#[tokio::test]
async fn test_close_releases_socket_when_peer_stops_reading() {
    let dir = tempfile::tempdir().unwrap();
    let (relay, relay_path, _source) =
        flood_without_reading(&dir, Duration::from_secs(60), 200).await;

    relay.close();
    within(relay.stopped().wait()).await;

    assert!(eventually(|| session_count(&relay) == 0).await);
    assert!(eventually(|| relay.stats().active == 0).await);

    // Once every session let go of it, nothing is bound to the path
    let other = std::os::unix::net::UnixDatagram::unbound().unwrap();
    assert!(eventually(|| other.send_to(b"anyone?", &relay_path).is_err()).await);
}
