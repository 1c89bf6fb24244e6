//! Integration tests for OverlinkNode
//!
//! Whole nodes talk over real loopback TCP, the uplink protocol (directly
//! and through a relay) and the in-memory virtual network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use overlink_core::{
    NetworkContactPoint, NodeIdentifier, RpcError, RpcResult, VIRTUAL_TRANSPORT_ID,
    VirtualNetwork,
};
use overlink_node::{ECHO_SERVICE, NodeConfig, OverlinkNode};
use overlink_rpc::{CallContext, HANDLER_PANIC, RemoteService, decode_args, encode_value};
use overlink_uplink::{UplinkConfig, UplinkRelay};

const WAIT: Duration = Duration::from_secs(10);

fn tcp_node(name: &str) -> OverlinkNode {
    OverlinkNode::new(NodeConfig::default().with_display_name(name)).unwrap()
}

async fn virtual_node(network: &Arc<VirtualNetwork>, name: &str) -> (OverlinkNode, NetworkContactPoint) {
    let node = OverlinkNode::with_virtual_network(NodeConfig::default().with_display_name(name), network)
        .unwrap();
    node.start().await.unwrap();
    let endpoint = node
        .listen(&NetworkContactPoint::any_port(VIRTUAL_TRANSPORT_ID, name).unwrap())
        .await
        .unwrap();
    (node, endpoint)
}

/// Poll `condition` until it holds or the wait runs out
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

struct Calculator;

#[async_trait]
impl RemoteService for Calculator {
    fn interface_name(&self) -> &str {
        "test.Calculator"
    }

    fn remote_methods(&self) -> &[&'static str] {
        &["add", "divide", "sleep", "explode"]
    }

    async fn invoke(&self, _ctx: &CallContext, method: &str, args: Bytes) -> RpcResult<Bytes> {
        match method {
            "add" => {
                let (a, b): (i64, i64) = decode_args(&args)?;
                encode_value(&(a + b))
            }
            "divide" => {
                let (a, b): (i64, i64) = decode_args(&args)?;
                if b == 0 {
                    return Err(RpcError::ServiceFailed {
                        error_type: "DivisionByZero".into(),
                        message: format!("{a} / 0"),
                    });
                }
                encode_value(&(a / b))
            }
            "explode" => panic!("calculator on fire"),
            "sleep" => {
                let ms: u64 = decode_args(&args)?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                encode_value(&())
            }
            other => Err(RpcError::MethodNotAllowed {
                service: "test.Calculator".into(),
                method: other.into(),
            }),
        }
    }
}

#[tokio::test]
async fn test_echo_over_loopback_tcp() {
    let y = tcp_node("y");
    y.start().await.unwrap();
    let endpoint = y
        .listen(&NetworkContactPoint::any_port("direct", "127.0.0.1").unwrap())
        .await
        .unwrap();
    assert_ne!(endpoint.port(), 0);

    let x = tcp_node("x");
    x.start().await.unwrap();
    let channel = x.connect(&endpoint).await.unwrap();
    assert_eq!(channel.remote_node_id(), y.session_id());
    assert_eq!(channel.remote_display_name(), "y");

    let reply = tokio::time::timeout(
        x.config().rpc.default_timeout(),
        x.echo_proxy(y.logical_node_id()).echo("hi"),
    )
    .await
    .expect("echo within the default timeout")
    .unwrap();
    assert_eq!(reply, "hi");

    x.shutdown().await;
    y.shutdown().await;
}

#[tokio::test]
async fn test_large_payload_over_tcp() {
    let y = tcp_node("y");
    y.start().await.unwrap();
    let endpoint = y
        .listen(&NetworkContactPoint::any_port("direct", "127.0.0.1").unwrap())
        .await
        .unwrap();
    let x = tcp_node("x");
    x.connect(&endpoint).await.unwrap();

    let payload = Bytes::from((0..1024 * 1024).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
    let reply = x
        .echo_proxy(y.logical_node_id())
        .echo_bytes(payload.clone())
        .await
        .unwrap();
    assert_eq!(reply, payload);

    x.shutdown().await;
    y.shutdown().await;
}

#[tokio::test]
async fn test_echo_over_uplink() {
    let server = tcp_node("server");
    server.start().await.unwrap();
    let endpoint = server
        .listen(&NetworkContactPoint::any_port("uplink", "127.0.0.1").unwrap())
        .await
        .unwrap();

    let client = tcp_node("client");
    let channel = client.connect(&endpoint).await.unwrap();
    assert_eq!(channel.transport_id(), "uplink");

    let reply = client
        .echo_proxy(server.logical_node_id())
        .echo("over uplink")
        .await
        .unwrap();
    assert_eq!(reply, "over uplink");

    // And the other way round over the same connection
    assert!(server.wait_until_reachable(client.session_id(), WAIT).await);
    let reply = server
        .echo_proxy(client.logical_node_id())
        .echo("back")
        .await
        .unwrap();
    assert_eq!(reply, "back");

    client.shutdown().await;
    server.shutdown().await;
}

/// Both nodes only dial the relay; it forwards the node channel by namespace
#[tokio::test]
async fn test_echo_through_uplink_relay() {
    let relay = UplinkRelay::new("relay", UplinkConfig::default());
    let address = relay.listen("127.0.0.1:0").await.unwrap();
    let relay_cp: NetworkContactPoint = format!("uplink:127.0.0.1:{}", address.port()).parse().unwrap();

    let server = OverlinkNode::new(
        NodeConfig::default()
            .with_display_name("server")
            .with_uplink(UplinkConfig::default().with_namespace("site-b"))
            .with_relay(&relay_cp),
    )
    .unwrap();
    server.start().await.unwrap();
    assert!(eventually(|| relay.is_namespace_assigned("site-b")).await);

    let client = tcp_node("client");
    client.start().await.unwrap();
    let channel = client.connect_via_relay(&relay_cp, "site-b/node").await.unwrap();
    assert_eq!(channel.remote_node_id(), server.session_id());
    assert_eq!(relay.forwarded_channels(), 1);

    let reply = client
        .echo_proxy(server.logical_node_id())
        .echo("via relay")
        .await
        .unwrap();
    assert_eq!(reply, "via relay");

    assert!(server.wait_until_reachable(client.session_id(), WAIT).await);
    let reply = server
        .echo_proxy(client.logical_node_id())
        .echo("and back")
        .await
        .unwrap();
    assert_eq!(reply, "and back");

    client.shutdown().await;
    server.shutdown().await;
    relay.shutdown();
}

#[tokio::test]
async fn test_no_route_after_only_link_removed() {
    let network = VirtualNetwork::new();
    let (x, _) = virtual_node(&network, "x").await;
    let (z, z_endpoint) = virtual_node(&network, "z").await;

    x.connect(&z_endpoint).await.unwrap();
    assert_eq!(
        x.echo_proxy(z.logical_node_id()).echo("before").await.unwrap(),
        "before"
    );

    assert_eq!(network.disconnect(x.session_id(), z.session_id()).await, 2);

    let result = tokio::time::timeout(
        Duration::from_millis(500),
        x.rpc(&z.logical_node_id(), ECHO_SERVICE, "echo", Bytes::new()),
    )
    .await
    .expect("failing call must not block");
    assert!(matches!(result, Err(RpcError::NoRoute(_))));

    assert!(eventually(|| !x.topology().is_reachable(z.session_id())).await);
    assert!(x.neighbours().is_empty());
}

#[tokio::test]
async fn test_multi_hop_call() {
    let network = VirtualNetwork::new();
    let (x, _) = virtual_node(&network, "x").await;
    let (y, y_endpoint) = virtual_node(&network, "y").await;
    let (z, _) = virtual_node(&network, "z").await;

    x.connect(&y_endpoint).await.unwrap();
    z.connect(&y_endpoint).await.unwrap();

    assert!(x.wait_until_reachable(z.session_id(), WAIT).await);
    assert!(z.wait_until_reachable(x.session_id(), WAIT).await);

    let graph = x.graph();
    assert_eq!(graph.hop_count(z.session_id()), Some(2));
    assert_eq!(graph.next_hop(z.session_id()), Some(y.session_id()));
    assert_eq!(
        graph.path_to(z.session_id()).unwrap(),
        vec![x.session_id().clone(), y.session_id().clone(), z.session_id().clone()]
    );

    z.register_service(Arc::new(Calculator)).unwrap();
    let calc = x.proxy(z.logical_node_id(), "test.Calculator");
    let sum: i64 = calc.call("add", &(40i64, 2i64)).await.unwrap();
    assert_eq!(sum, 42);

    // z is only reachable through y
    assert!(!x.neighbours().contains(z.session_id()));
}

#[tokio::test]
async fn test_remote_faults_reach_the_caller() {
    let network = VirtualNetwork::new();
    let (x, _) = virtual_node(&network, "x").await;
    let (y, y_endpoint) = virtual_node(&network, "y").await;
    y.register_service(Arc::new(Calculator)).unwrap();
    x.connect(&y_endpoint).await.unwrap();

    let calc = x.proxy(y.logical_node_id(), "test.Calculator");
    let err = calc.call::<_, i64>("divide", &(1i64, 0i64)).await.unwrap_err();
    match err {
        RpcError::ServiceFailed { error_type, .. } => assert_eq!(error_type, "DivisionByZero"),
        other => panic!("unexpected {other:?}"),
    }

    // A panicking handler answers with a fault instead of leaving the caller waiting
    let err = tokio::time::timeout(Duration::from_secs(2), calc.call::<_, i64>("explode", &()))
        .await
        .expect("panic must be answered before the call timeout")
        .unwrap_err();
    match err {
        RpcError::ServiceFailed { error_type, message } => {
            assert_eq!(error_type, HANDLER_PANIC);
            assert_eq!(message, "calculator on fire");
        }
        other => panic!("unexpected {other:?}"),
    }

    let err = calc.call::<_, i64>("shutdown", &()).await.unwrap_err();
    assert!(matches!(err, RpcError::MethodNotAllowed { .. }));

    let err = x
        .rpc(&y.logical_node_id(), "test.Missing", "anything", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::ServiceNotFound(_)));

    let err = x
        .rpc_with_timeout(
            &y.logical_node_id(),
            "test.Calculator",
            "sleep",
            encode_value(&2_000u64).unwrap(),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::RemoteTimeout { .. }));
}

#[tokio::test]
async fn test_capability_query_across_overlay() {
    let network = VirtualNetwork::new();
    let (x, _) = virtual_node(&network, "x").await;
    let (y, y_endpoint) = virtual_node(&network, "y").await;
    let (z, _) = virtual_node(&network, "z").await;
    x.connect(&y_endpoint).await.unwrap();
    z.connect(&y_endpoint).await.unwrap();

    let gpu = z.add_logical_node("7", "gpu-box", ["gpu", "compute"]).unwrap();
    let cpu = y.add_logical_node("3", "cpu-box", ["compute"]).unwrap();

    assert!(eventually(|| x.reachable_nodes_with_capability("compute").len() == 2).await);
    let gpus = x.reachable_nodes_with_capability("gpu");
    assert_eq!(gpus.into_iter().collect::<Vec<_>>(), vec![gpu.clone()]);
    assert!(x.graph().is_logical_node_reachable(&cpu));

    // Withdrawn logical nodes disappear everywhere
    assert!(z.remove_logical_node("7"));
    assert!(eventually(|| x.reachable_nodes_with_capability("gpu").is_empty()).await);
    assert_eq!(gpu.session_id(), *z.session_id());
}

#[tokio::test]
async fn test_shutdown_is_announced() {
    let network = VirtualNetwork::new();
    let (x, _) = virtual_node(&network, "x").await;
    let (y, y_endpoint) = virtual_node(&network, "y").await;
    let (z, _) = virtual_node(&network, "z").await;
    x.connect(&y_endpoint).await.unwrap();
    z.connect(&y_endpoint).await.unwrap();
    assert!(x.wait_until_reachable(z.session_id(), WAIT).await);

    z.shutdown().await;
    assert!(z.is_shut_down());
    assert!(eventually(|| !x.topology().is_reachable(z.session_id())).await);
    assert!(eventually(|| !y.neighbours().contains(z.session_id())).await);
    assert!(x.topology().is_reachable(y.session_id()));

    let err = x
        .rpc(&z.logical_node_id(), ECHO_SERVICE, "echo", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::NoRoute(_)));

    // A shut down node cannot be used again
    assert!(z.connect(&y_endpoint).await.is_err());
}

#[tokio::test]
async fn test_configured_peers_are_connected_on_start() {
    let network = VirtualNetwork::new();
    let (y, y_endpoint) = virtual_node(&network, "y").await;

    let x = OverlinkNode::with_virtual_network(
        NodeConfig::default()
            .with_display_name("x")
            .with_connect(&y_endpoint)
            .with_connect("virtual:nowhere:1"),
        &network,
    )
    .unwrap();
    // The unreachable peer is skipped
    x.start().await.unwrap();

    assert!(x.neighbours().contains(y.session_id()));
    assert!(eventually(|| y.neighbours().contains(x.session_id())).await);
    assert_eq!(
        y.echo_proxy(x.logical_node_id()).echo("hello x").await.unwrap(),
        "hello x"
    );
    assert_eq!(x.session_id().short_id().len(), 8);
}
