//! Integration tests for activation through to running relays

mod common;

use std::os::fd::{IntoRawFd, OwnedFd};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

use common::{exchange, read_to_end, spawn_tcp_echo, spawn_udp_tagger, within};
use init_proxyd::activation::{self, FdList, InheritedSocket};
use init_proxyd::shutdown::ShutdownReason;
use init_proxyd::{RelayOptions, ShutdownCoordinator, SocketKind, Supervisor};

#[tokio::test]
async fn test_activate_listed_descriptors() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

    let mut source = FdList::new(vec![listener.into_raw_fd(), socket.into_raw_fd()]);
    let sockets = activation::activate(&mut source).unwrap();

    let kinds: Vec<SocketKind> = sockets.iter().map(|socket| socket.kind).collect();
    assert_eq!(kinds, vec![SocketKind::Stream, SocketKind::Packet]);

    // The list hands its descriptors over once
    assert!(activation::activate(&mut source).is_err());
}

#[tokio::test]
async fn test_supervisor_relays_stream_and_packet_sockets() {
    let echo = spawn_tcp_echo().await;

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let stream_addr = listener.local_addr().unwrap();
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

    let sockets = vec![
        InheritedSocket::classify(OwnedFd::from(listener), Some("web".to_string())).unwrap(),
        InheritedSocket::classify(OwnedFd::from(socket), None).unwrap(),
    ];

    // Without a network each relay keeps the network of its own socket
    let destination = format!("127.0.0.1:{}", echo.port());
    let supervisor = Supervisor::launch(sockets, &destination, RelayOptions::default()).unwrap();

    let relays = supervisor.relays();
    assert_eq!(relays.len(), 2);
    assert_eq!(relays[0].kind(), SocketKind::Stream);
    assert_eq!(relays[0].destination().to_string(), format!("tcp://{}", destination));
    assert_eq!(relays[1].kind(), SocketKind::Packet);
    assert_eq!(relays[1].destination().to_string(), format!("udp://{}", destination));

    let mut client = TcpStream::connect(stream_addr).await.unwrap();
    client.write_all(b"supervised").await.unwrap();
    client.shutdown().await.unwrap();
    assert_eq!(read_to_end(&mut client).await, b"supervised");

    within(supervisor.shutdown()).await;
    assert!(supervisor.relays().iter().all(|relay| relay.is_stopped()));
}

#[tokio::test]
async fn test_wait_any_reports_stopped_relay() {
    let tagger = spawn_udp_tagger().await;

    let mut sockets = Vec::new();
    let mut addrs = Vec::new();
    for _ in 0..3 {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        addrs.push(socket.local_addr().unwrap());
        sockets.push(InheritedSocket::classify(OwnedFd::from(socket), None).unwrap());
    }

    let supervisor =
        Supervisor::launch(sockets, &tagger.to_string(), RelayOptions::default()).unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (_, echoed) = exchange(&client, addrs[2], "through third").await;
    assert_eq!(echoed, "through third");

    supervisor.relays()[1].close();
    let index = within(supervisor.wait_any()).await;
    assert_eq!(index, 1);
    assert!(!supervisor.relays()[0].is_stopped());

    within(supervisor.shutdown()).await;
    assert!(supervisor.relays().iter().all(|relay| relay.is_stopped()));
}

#[tokio::test]
async fn test_launch_without_sockets() {
    let supervisor = Supervisor::launch(Vec::new(), ":80", RelayOptions::default()).unwrap();
    assert!(supervisor.relays().is_empty());

    // Nothing to wait for: wait_any never resolves
    let waited = tokio::time::timeout(
        std::time::Duration::from_millis(50),
        supervisor.wait_any(),
    )
    .await;
    assert!(waited.is_err());

    within(supervisor.shutdown()).await;
}

#[tokio::test]
async fn test_shutdown_coordinator_notifies_observers() {
    let coordinator = ShutdownCoordinator::new();
    let mut first = coordinator.subscribe();
    let mut second = coordinator.subscribe();

    coordinator.request_shutdown();
    coordinator.request_shutdown();

    within(first.wait()).await;
    within(second.wait()).await;
    assert!(first.is_triggered());
}

fn packet_supervisor(count: usize, destination: &str) -> Supervisor {
    let sockets = (0..count)
        .map(|_| {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            InheritedSocket::classify(OwnedFd::from(socket), None).unwrap()
        })
        .collect();
    Supervisor::launch(sockets, destination, RelayOptions::default()).unwrap()
}

#[tokio::test]
async fn test_run_ends_cleanly_on_shutdown_request() {
    let tagger = spawn_udp_tagger().await;
    let supervisor = packet_supervisor(2, &tagger.to_string());

    let result = within(supervisor.run(async { Ok::<_, anyhow::Error>(ShutdownReason::Terminate) })).await;
    assert!(result.is_ok());
    assert!(supervisor.relays().iter().all(|relay| relay.is_stopped()));
}

#[tokio::test]
async fn test_run_fails_when_signals_cannot_be_awaited() {
    let tagger = spawn_udp_tagger().await;
    let supervisor = packet_supervisor(2, &tagger.to_string());

    let result = within(supervisor.run(async {
        Err::<ShutdownReason, _>(anyhow::anyhow!("signal handler registration refused"))
    }))
    .await;

    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("signal handler registration refused"));
    assert!(supervisor.relays().iter().all(|relay| relay.is_stopped()));
}

#[tokio::test]
async fn test_run_fails_when_a_relay_exits() {
    let tagger = spawn_udp_tagger().await;
    let supervisor = packet_supervisor(3, &tagger.to_string());

    let (result, _) = within(async {
        tokio::join!(
            supervisor.run(std::future::pending::<init_proxyd::Result<ShutdownReason>>()),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                supervisor.relays()[2].close();
            },
        )
    })
    .await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains(supervisor.relays()[2].local_label()));
    assert!(supervisor.relays().iter().all(|relay| relay.is_stopped()));
}
