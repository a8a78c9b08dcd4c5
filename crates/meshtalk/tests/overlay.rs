//! End-to-end overlay behaviour, driven against real nodes listening on
//! ephemeral localhost ports.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshtalk::node::{Node, NodeEvent};
use meshtalk::server::Listener;
use meshtalk_core::config::Config;
use meshtalk_core::protocol::{Message, MessageId, MsgType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Starts a node on an OS-assigned port with its accept loop running.
async fn spawn_node(config: Config) -> Arc<Node> {
    let listener = Listener::bind(0, config.max_connections as u32).unwrap();
    let host = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), listener.port());
    let node = Arc::new(Node::new(config, host));
    tokio::spawn(listener.accept_loop(Arc::clone(&node)));
    node
}

/// A config with a small neighbour target, so line topologies built by
/// hand stay lines.
fn config_with_target(neighbours: usize) -> Config {
    Config {
        neighbours,
        ..Config::default()
    }
}

/// An address nothing listens on.
fn unused_addr() -> SocketAddrV4 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
}

/// Builds a message with a fixed id, as an external origin would.
fn craft(msg_type: MsgType, origin: SocketAddrV4, ttl: u8, id: [u8; 4]) -> Message {
    Message::with_id(msg_type, origin, 1, ttl, MessageId(id), Vec::new())
}

/// One-shot raw byte send, closing the connection right after.
async fn send_raw(addr: SocketAddrV4, bytes: &[u8]) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(bytes).await.unwrap();
    stream.flush().await.unwrap();
}

#[tokio::test]
async fn two_node_bootstrap() {
    let a = spawn_node(Config::default()).await;
    let b = spawn_node(Config::default()).await;

    let started = Instant::now();
    b.bootstrap(a.host_addr()).await;
    assert!(started.elapsed() < Duration::from_secs(4));

    assert!(b.outbound_addrs().contains(&a.host_addr()));
    assert!(a.outbound_addrs().contains(&b.host_addr()));
}

#[tokio::test]
async fn bootstrap_refused_continues_detached() {
    let b = spawn_node(Config::default()).await;

    let started = Instant::now();
    b.bootstrap(unused_addr()).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(b.outbound_addrs().is_empty());

    // The node keeps serving.
    TcpStream::connect(b.host_addr()).await.unwrap();
}

#[tokio::test]
async fn ping_flood_is_deduplicated() {
    let a = spawn_node(config_with_target(1)).await;
    let b = spawn_node(config_with_target(1)).await;
    let c = spawn_node(config_with_target(1)).await;
    a.connect_neighbour(b.host_addr()).await.unwrap();
    b.connect_neighbour(c.host_addr()).await.unwrap();

    let ping = craft(MsgType::Ping, unused_addr(), 5, [0xaa, 0xbb, 0xcc, 0x01]);
    let bytes = ping.to_bytes();

    send_raw(a.host_addr(), &bytes).await;
    sleep(Duration::from_millis(500)).await;
    assert!(c.seen_ping(ping.id()), "ping should reach the end of the line");
    assert_eq!(c.seen_ping_count(), 1);

    // Byte-identical replay: dropped at the first hop.
    send_raw(a.host_addr(), &bytes).await;
    sleep(Duration::from_millis(500)).await;
    assert_eq!(a.seen_ping_count(), 1);
    assert_eq!(c.seen_ping_count(), 1);
}

#[tokio::test]
async fn ttl_expiry_stops_forwarding() {
    let b = spawn_node(config_with_target(1)).await;
    let c = spawn_node(config_with_target(1)).await;
    b.connect_neighbour(c.host_addr()).await.unwrap();

    let ping = craft(MsgType::Ping, unused_addr(), 1, [0xaa, 0xbb, 0xcc, 0x02]);
    send_raw(b.host_addr(), &ping.to_bytes()).await;
    sleep(Duration::from_millis(500)).await;

    assert!(b.seen_ping(ping.id()));
    assert_eq!(c.seen_ping_count(), 0, "ttl 1 must not survive a forward");
}

#[tokio::test]
async fn pong_candidates_reach_the_bootstrapper() {
    let a = spawn_node(Config::default()).await;
    let b = spawn_node(Config::default()).await;
    let c = spawn_node(Config::default()).await;
    b.connect_neighbour(c.host_addr()).await.unwrap();

    // A's ping floods B -> C; both answer with pongs carrying the same
    // message id, so both end up in A's neighbour set.
    a.bootstrap(b.host_addr()).await;

    let outbound = a.outbound_addrs();
    assert!(outbound.contains(&b.host_addr()));
    assert!(outbound.contains(&c.host_addr()));
}

#[tokio::test]
async fn post_resolves_and_delivers() {
    let a = spawn_node(Config::default()).await;
    let b = spawn_node(Config::default()).await;
    a.connect_neighbour(b.host_addr()).await.unwrap();

    let mut chats = b.subscribe();
    a.post(b.peer_id().clone(), "hola desde a").await.unwrap();

    let event = timeout(Duration::from_secs(2), chats.recv())
        .await
        .expect("chat should arrive promptly")
        .unwrap();
    match event {
        NodeEvent::Chat { from, body } => {
            assert_eq!(from, a.host_addr());
            assert_eq!(body, "hola desde a");
        }
    }
}

#[tokio::test]
async fn post_resolves_through_an_intermediate_hop() {
    let a = spawn_node(config_with_target(1)).await;
    let b = spawn_node(config_with_target(1)).await;
    let c = spawn_node(config_with_target(1)).await;
    a.connect_neighbour(b.host_addr()).await.unwrap();
    b.connect_neighbour(c.host_addr()).await.unwrap();

    let mut chats = c.subscribe();
    a.post(c.peer_id().clone(), "through the line").await.unwrap();

    let event = timeout(Duration::from_secs(2), chats.recv())
        .await
        .expect("chat should arrive promptly")
        .unwrap();
    match event {
        NodeEvent::Chat { from, body } => {
            assert_eq!(from, a.host_addr());
            assert_eq!(body, "through the line");
        }
    }
}

#[tokio::test]
async fn post_to_unknown_peer_fails() {
    let a = spawn_node(Config::default()).await;
    let b = spawn_node(Config::default()).await;
    let c = spawn_node(Config::default()).await;
    a.connect_neighbour(b.host_addr()).await.unwrap();

    // C is not reachable through the overlay from A.
    let err = a.post(c.peer_id().clone(), "anyone there?").await;
    assert!(err.is_err());
}

#[tokio::test]
async fn join_handshake_registers_both_sides() {
    let a = spawn_node(Config::default()).await;
    let b = spawn_node(Config::default()).await;

    a.join(b.host_addr()).await.unwrap();
    sleep(Duration::from_millis(500)).await;

    assert!(a.outbound_addrs().contains(&b.host_addr()));
    assert!(b.inbound_addrs().contains(&a.host_addr()));
}

#[tokio::test]
async fn shutdown_sends_bye_to_neighbours() {
    let a = spawn_node(Config::default()).await;
    let b = spawn_node(Config::default()).await;
    let c = spawn_node(Config::default()).await;
    a.connect_neighbour(b.host_addr()).await.unwrap();
    a.connect_neighbour(c.host_addr()).await.unwrap();
    b.connect_neighbour(a.host_addr()).await.unwrap();
    c.connect_neighbour(a.host_addr()).await.unwrap();

    let started = Instant::now();
    a.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(a.outbound_addrs().is_empty());

    sleep(Duration::from_millis(300)).await;
    assert!(!b.outbound_addrs().contains(&a.host_addr()));
    assert!(!c.outbound_addrs().contains(&a.host_addr()));
}

#[tokio::test]
async fn unknown_message_type_closes_only_that_connection() {
    let a = spawn_node(Config::default()).await;

    let mut bytes = craft(MsgType::Ping, unused_addr(), 5, [9, 9, 9, 9]).to_bytes();
    bytes[1] = 0x7f;

    let mut stream = TcpStream::connect(a.host_addr()).await.unwrap();
    stream.write_all(&bytes).await.unwrap();

    // The node closes the offending connection...
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("node should close the connection")
        .unwrap();
    assert_eq!(n, 0);

    // ...and keeps accepting new ones.
    TcpStream::connect(a.host_addr()).await.unwrap();
}
