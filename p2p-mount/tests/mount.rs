use std::sync::Arc;
use std::time::Duration;

use p2p_mount::{Endpoint, MountConfig, MountError, Overlay, Role, TunnelRegistry};
use p2p_mount_net::{MemoryNetwork, MemoryOverlay};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// A loopback address nothing listens on right now.
fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    Endpoint::try_from(listener.local_addr().unwrap()).unwrap().to_string()
}

async fn connect(addr: &str) -> std::io::Result<TcpStream> {
    let endpoint: Endpoint = addr.parse().unwrap();
    TcpStream::connect((endpoint.host(), endpoint.port())).await
}

async fn echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = Endpoint::try_from(listener.local_addr().unwrap()).unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut tcp, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = tcp.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

struct Node {
    overlay: Arc<MemoryOverlay>,
    registry: TunnelRegistry,
}

fn node(network: &MemoryNetwork) -> Node {
    let overlay = Arc::new(network.node());
    let registry = TunnelRegistry::new(overlay.clone(), MountConfig::default());
    Node { overlay, registry }
}

/// Poll `check` until it holds, for at most five seconds.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn listen_shows_up_in_list() {
    setup_logging();
    let network = MemoryNetwork::new();
    let server = network.node().local_peer_id();
    let config = MountConfig {
        default_peer: Some(server),
        ..MountConfig::default()
    };
    let a = TunnelRegistry::new(Arc::new(network.node()), config);
    let addr = free_addr();

    let info = assert_ok!(a.listen("demo", &addr, None).await);
    assert_eq!(info.role, Role::Listen);
    assert_eq!(info.peer, Some(server));

    let (listeners, streams) = a.list().await;
    assert_eq!(listeners.len(), 1);
    assert_eq!(listeners[0].protocol, "demo");
    assert_eq!(listeners[0].target_address.to_string(), addr);
    assert!(streams.is_empty());

    a.shutdown().await;
}

#[tokio::test]
async fn listen_without_a_peer_is_refused() {
    setup_logging();
    let network = MemoryNetwork::new();
    let a = node(&network);
    let addr = free_addr();

    let err = assert_err!(a.registry.listen("demo", &addr, None).await);
    assert!(matches!(err, MountError::NoPeerTarget(p) if p == "demo"));
    assert!(a.registry.is_empty().await);
    assert_err!(connect(&addr).await);

    a.registry.shutdown().await;
}

#[tokio::test]
async fn forward_without_a_peer_serves_every_node() {
    setup_logging();
    let network = MemoryNetwork::new();
    let a = node(&network);
    let b = node(&network);
    let c = node(&network);
    let echo = echo_server().await;

    let b_id = b.registry.local_peer_id().to_string();
    let forward = assert_ok!(b.registry.forward("echo", &echo, None).await);
    assert_eq!(forward.peer, None);

    for client_node in [&a, &c] {
        let addr = free_addr();
        assert_ok!(client_node.registry.listen("echo", &addr, Some(&b_id)).await);

        let mut client = assert_ok!(connect(&addr).await);
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let (_, streams) = b.registry.list().await;
        assert!(streams.iter().any(|s| s.peer == client_node.overlay.local_peer_id()));
    }

    a.registry.shutdown().await;
    b.registry.shutdown().await;
    c.registry.shutdown().await;
}

#[tokio::test]
async fn second_binding_is_rejected_and_first_survives() {
    setup_logging();
    let network = MemoryNetwork::new();
    let a = node(&network);
    let addr = free_addr();
    let peer = network.node().local_peer_id().to_string();

    assert_ok!(a.registry.listen("demo", &addr, Some(&peer)).await);
    let err = assert_err!(a.registry.listen("demo", &free_addr(), Some(&peer)).await);
    assert!(matches!(err, MountError::ProtocolInUse(p) if p == "demo"));

    let (listeners, _) = a.registry.list().await;
    assert_eq!(listeners.len(), 1);
    assert_eq!(listeners[0].target_address.to_string(), addr);
    assert_ok!(connect(&addr).await);

    a.registry.shutdown().await;
}

#[tokio::test]
async fn closing_unknown_protocol_changes_nothing() {
    setup_logging();
    let network = MemoryNetwork::new();
    let a = node(&network);
    let peer = network.node().local_peer_id().to_string();
    assert_ok!(a.registry.listen("demo", &free_addr(), Some(&peer)).await);

    let err = assert_err!(a.registry.close("nope").await);
    assert!(matches!(err, MountError::NotFound(p) if p == "nope"));
    assert!(a.registry.contains("demo").await);
    assert_eq!(a.registry.len().await, 1);

    a.registry.shutdown().await;
}

#[tokio::test]
async fn bytes_flow_both_ways_and_eof_propagates() {
    setup_logging();
    let network = MemoryNetwork::new();
    let a = node(&network);
    let b = network.node();
    let mut inbound = assert_ok!(b.register_handler("demo"));

    let addr = free_addr();
    let peer = b.local_peer_id().to_string();
    assert_ok!(a.registry.listen("demo", &addr, Some(&peer)).await);

    let mut client = assert_ok!(connect(&addr).await);
    let mut incoming = inbound.recv().await.unwrap();
    assert_eq!(incoming.peer, a.overlay.local_peer_id());

    client.write_all(b"request").await.unwrap();
    let mut buf = [0u8; 7];
    incoming.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"request");

    incoming.stream.write_all(b"response").await.unwrap();
    let mut buf = [0u8; 8];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"response");

    let (_, streams) = a.registry.list().await;
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].protocol, "demo");
    assert_eq!(streams[0].target_address.to_string(), addr);
    assert_eq!(
        streams[0].origin_address,
        Endpoint::try_from(client.local_addr().unwrap()).unwrap()
    );
    assert_eq!(streams[0].peer, b.local_peer_id());

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    incoming.stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    a.registry.shutdown().await;
}

#[tokio::test]
async fn close_releases_port_and_sessions() {
    setup_logging();
    let network = MemoryNetwork::new();
    let a = node(&network);
    let b = network.node();
    let mut inbound = assert_ok!(b.register_handler("demo"));

    let addr = free_addr();
    let peer = b.local_peer_id().to_string();
    assert_ok!(a.registry.listen("demo", &addr, Some(&peer)).await);

    let mut client = assert_ok!(connect(&addr).await);
    let mut incoming = inbound.recv().await.unwrap();
    client.write_all(b"x").await.unwrap();
    let mut byte = [0u8; 1];
    incoming.stream.read_exact(&mut byte).await.unwrap();

    assert_ok!(a.registry.close("demo").await);

    let (listeners, streams) = a.registry.list().await;
    assert!(listeners.is_empty());
    assert!(streams.is_empty());
    assert_err!(connect(&addr).await);

    // the cancelled session closed both of its sides
    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest).await;
    let mut rest = Vec::new();
    assert_ok!(incoming.stream.read_to_end(&mut rest).await);

    a.registry.shutdown().await;
}

#[tokio::test]
async fn broken_session_is_removed_without_touching_others() {
    setup_logging();
    let network = MemoryNetwork::new();
    let a = node(&network);
    let b = network.node();
    let mut inbound = assert_ok!(b.register_handler("demo"));

    let addr = free_addr();
    let peer = b.local_peer_id().to_string();
    assert_ok!(a.registry.listen("demo", &addr, Some(&peer)).await);

    let mut doomed = assert_ok!(connect(&addr).await);
    let doomed_stream = inbound.recv().await.unwrap();
    let mut healthy = assert_ok!(connect(&addr).await);
    let mut healthy_stream = inbound.recv().await.unwrap();

    let registry = &a.registry;
    eventually(|| async move { registry.list().await.1.len() == 2 }).await;

    // the far end vanishes mid-transfer
    drop(doomed_stream);
    let _ = doomed.write_all(b"into the void").await;
    let mut rest = Vec::new();
    let _ = doomed.read_to_end(&mut rest).await;
    assert!(rest.is_empty());

    eventually(|| async move { registry.list().await.1.len() == 1 }).await;

    healthy.write_all(b"still ok").await.unwrap();
    let mut buf = [0u8; 8];
    healthy_stream.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still ok");

    a.registry.shutdown().await;
}

#[tokio::test]
async fn listen_and_forward_chain_reaches_echo_server() {
    setup_logging();
    let network = MemoryNetwork::new();
    let a = node(&network);
    let b = node(&network);
    let echo = echo_server().await;

    let a_id = a.registry.local_peer_id().to_string();
    let b_id = b.registry.local_peer_id().to_string();
    let forward = assert_ok!(b.registry.forward("echo", &echo, Some(&a_id)).await);
    assert_eq!(forward.role, Role::Forward);
    assert_eq!(forward.target_address.to_string(), echo);

    let addr = free_addr();
    assert_ok!(a.registry.listen("echo", &addr, Some(&b_id)).await);

    let mut client = assert_ok!(connect(&addr).await);
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
    let (mut reader, mut writer) = client.split();
    let send = async {
        writer.write_all(&payload).await.unwrap();
        writer.shutdown().await.unwrap();
    };
    let mut echoed = Vec::new();
    let receive = reader.read_to_end(&mut echoed);
    let ((), received) = tokio::join!(send, receive);
    assert_eq!(received.unwrap(), payload.len());
    assert_eq!(echoed, payload);

    let registry = &b.registry;
    eventually(|| async move { registry.list().await.1.is_empty() }).await;

    a.registry.shutdown().await;
    b.registry.shutdown().await;
}

#[tokio::test]
async fn forward_ignores_unauthorised_peers() {
    setup_logging();
    let network = MemoryNetwork::new();
    let a = node(&network);
    let b = node(&network);
    let stranger = node(&network);
    let echo = echo_server().await;

    let a_id = a.registry.local_peer_id().to_string();
    let b_id = b.registry.local_peer_id().to_string();
    assert_ok!(b.registry.forward("echo", &echo, Some(&a_id)).await);

    let addr = free_addr();
    assert_ok!(stranger.registry.listen("echo", &addr, Some(&b_id)).await);

    let mut client = assert_ok!(connect(&addr).await);
    let _ = client.write_all(b"hello?").await;
    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest).await;
    assert!(rest.is_empty());

    let (_, streams) = b.registry.list().await;
    assert!(streams.is_empty());

    stranger.registry.shutdown().await;
    b.registry.shutdown().await;
    a.registry.shutdown().await;
}

#[tokio::test]
async fn shutdown_clears_bindings_and_leaves_network() {
    setup_logging();
    let network = MemoryNetwork::new();
    let a = node(&network);
    let peer = a.registry.local_peer_id();

    let id = peer.to_string();
    assert_ok!(a.registry.listen("one", &free_addr(), Some(&id)).await);
    assert_ok!(a.registry.forward("two", &free_addr(), Some(&id)).await);
    assert_eq!(a.registry.len().await, 2);

    a.registry.shutdown().await;
    assert!(a.registry.is_empty().await);
    assert!(!network.contains(&peer));
    assert!(matches!(
        a.registry.forward("two", &free_addr(), Some(&id)).await,
        Err(MountError::Overlay(_))
    ));
}

#[tokio::test]
async fn slow_peer_hits_dial_timeout() {
    setup_logging();
    let network = MemoryNetwork::new().with_handler_queue(1);
    let overlay = Arc::new(network.node());
    let config = MountConfig {
        dial_timeout_ms: 100,
        ..MountConfig::default()
    };
    let registry = TunnelRegistry::new(overlay, config);

    // registered but never drained: the second stream cannot be delivered
    let b = network.node();
    let _inbound = assert_ok!(b.register_handler("demo"));
    let addr = free_addr();
    let peer = b.local_peer_id().to_string();
    assert_ok!(registry.listen("demo", &addr, Some(&peer)).await);

    let _first = assert_ok!(connect(&addr).await);
    let registry = &registry;
    eventually(|| async move { registry.list().await.1.len() == 1 }).await;

    let mut second = assert_ok!(connect(&addr).await);
    let mut rest = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), second.read_to_end(&mut rest)).await;
    assert!(rest.is_empty());

    registry.shutdown().await;
}
