//! Integration tests for overlink-uplink
//!
//! Sessions run over in-memory duplex streams; the provider and relay
//! tests use loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};

use overlink_core::{
    ChannelEvent, ChannelEventForwarder, ChannelState, HandshakeInfo, InstanceNodeId,
    MessageChannel, NetworkContactPoint, TransportContext, TransportProvider,
};
use overlink_uplink::{
    BlockType, ChannelDelivery, ChannelEndpoint, ChannelInfo, ChannelKind, ChannelOpenRequest,
    ChannelWriter, DisposeReason, EndpointFactory, ExecutionRole, MAX_BLOCK_PAYLOAD,
    MessageBlock, StandardEndpointFactory, UplinkConfig, UplinkError, UplinkHandshake,
    UplinkRelay, UplinkSession, UplinkTransportProvider, read_block, read_protocol_header, write_block,
    write_protocol_header,
};

type Received = mpsc::UnboundedSender<(String, Bytes)>;
type Disposed = mpsc::UnboundedSender<(String, DisposeReason)>;

/// Records what it receives; waits for the gate to open before each block
struct RecordingEndpoint {
    label: String,
    gate: Option<watch::Receiver<bool>>,
    received: Received,
    disposed: Disposed,
}

#[async_trait]
impl ChannelEndpoint for RecordingEndpoint {
    async fn process_message(&mut self, block: MessageBlock) {
        if let Some(gate) = &mut self.gate {
            let _ = gate.wait_for(|open| *open).await;
        }
        let _ = self.received.send((self.label.clone(), block.payload));
    }

    async fn dispose(&mut self, reason: DisposeReason) {
        let _ = self.disposed.send((self.label.clone(), reason));
    }
}

/// Accepts channels labelled `slow` (gated) and `fast`; refuses the rest
struct RecordingFactory {
    gate: watch::Receiver<bool>,
    received: Received,
    disposed: Disposed,
}

impl EndpointFactory for RecordingFactory {
    fn create_endpoint(
        &self,
        info: &ChannelInfo,
        _writer: ChannelWriter,
    ) -> Result<Box<dyn ChannelEndpoint>, String> {
        let gate = match info.request.label.as_str() {
            "slow" => Some(self.gate.clone()),
            "fast" => None,
            other => return Err(format!("unknown label {other}")),
        };
        Ok(Box::new(RecordingEndpoint {
            label: info.request.label.clone(),
            gate,
            received: self.received.clone(),
            disposed: self.disposed.clone(),
        }))
    }
}

struct Harness {
    client: UplinkSession,
    relay: UplinkSession,
    gate: watch::Sender<bool>,
    received: mpsc::UnboundedReceiver<(String, Bytes)>,
    disposed: mpsc::UnboundedReceiver<(String, DisposeReason)>,
}

async fn harness(config: UplinkConfig) -> Harness {
    let (gate, gate_rx) = watch::channel(false);
    let (received_tx, received) = mpsc::unbounded_channel();
    let (disposed_tx, disposed) = mpsc::unbounded_channel();
    let factory = RecordingFactory {
        gate: gate_rx,
        received: received_tx,
        disposed: disposed_tx,
    };
    let (client_factory, _) = StandardEndpointFactory::new();

    let (a, b) = tokio::io::duplex(256 * 1024);
    let (client, relay) = tokio::join!(
        UplinkSession::connect(a, "client", config.clone(), Arc::new(client_factory)),
        UplinkSession::accept(b, "relay", config, Arc::new(factory)),
    );
    Harness {
        client: client.unwrap(),
        relay: relay.unwrap(),
        gate,
        received,
        disposed,
    }
}

fn no_heartbeat() -> UplinkConfig {
    UplinkConfig::default().with_heartbeat(Duration::ZERO, Duration::from_secs(15))
}

fn file_channel(label: &str) -> ChannelOpenRequest {
    ChannelOpenRequest::new(ChannelKind::FileTransfer, label)
}

async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// A backlog on one logical channel does not hold up another channel
#[tokio::test]
async fn test_slow_channel_does_not_stall_others() {
    let mut h = harness(no_heartbeat()).await;
    let slow = h.client.open_channel(file_channel("slow")).unwrap();
    let fast = h.client.open_channel(file_channel("fast")).unwrap();
    assert_eq!((slow.id(), fast.id()), (1, 3));

    for i in 0..1000u32 {
        slow.send(Bytes::from(i.to_be_bytes().to_vec())).unwrap();
    }
    fast.send(Bytes::from_static(b"urgent")).unwrap();

    // The slow endpoint is stuck on its first block; the fast one still gets through
    let (label, payload) = within(h.received.recv()).await.unwrap();
    assert_eq!(label, "fast");
    assert_eq!(payload.as_ref(), b"urgent");

    h.gate.send(true).unwrap();
    for i in 0..1000u32 {
        let (label, payload) = within(h.received.recv()).await.unwrap();
        assert_eq!(label, "slow");
        assert_eq!(payload.as_ref(), &i.to_be_bytes());
    }
}

/// A refused open is answered with ERROR then CHANNEL_CLOSE
#[tokio::test]
async fn test_refused_channel() {
    let h = harness(no_heartbeat()).await;
    let mut channel = h.client.open_channel(file_channel("bogus")).unwrap();

    match within(channel.recv()).await {
        Some(ChannelDelivery::Error(reason)) => assert!(reason.contains("unknown label"), "{reason}"),
        other => panic!("expected refusal, got {other:?}"),
    }
    assert!(matches!(
        within(channel.recv()).await,
        Some(ChannelDelivery::Closed(DisposeReason::RemoteClose))
    ));
    assert!(!h.client.is_channel_open(channel.id()));
    assert_eq!(h.relay.channel_count(), 0);
    assert!(matches!(
        channel.send(Bytes::from_static(b"late")),
        Err(UplinkError::ChannelClosed(1))
    ));
}

/// Closing disposes both endpoints; the id comes back only after the grace period
#[tokio::test(start_paused = true)]
async fn test_channel_id_reuse_after_grace() {
    let config = no_heartbeat().with_channel_id_grace(Duration::from_secs(10));
    let mut h = harness(config).await;

    let first = h.client.open_channel(file_channel("fast")).unwrap();
    assert_eq!(first.id(), 1);
    first.send(Bytes::from_static(b"one")).unwrap();
    assert_eq!(within(h.received.recv()).await.unwrap().1.as_ref(), b"one");

    first.close();
    let (label, reason) = within(h.disposed.recv()).await.unwrap();
    assert_eq!(label, "fast");
    assert!(matches!(reason, DisposeReason::RemoteClose));
    assert!(h.client.is_id_quarantined(1));

    let second = h.client.open_channel(file_channel("fast")).unwrap();
    assert_eq!(second.id(), 3);

    tokio::time::advance(Duration::from_secs(10)).await;
    let third = h.client.open_channel(file_channel("fast")).unwrap();
    assert_eq!(third.id(), 1);
    assert!(!h.client.is_id_quarantined(1));

    third.send(Bytes::from_static(b"again")).unwrap();
    assert_eq!(within(h.received.recv()).await.unwrap().1.as_ref(), b"again");
}

/// Both sides can open channels at once without colliding
#[tokio::test]
async fn test_both_sides_open_channels() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (fa, mut incoming_a) = StandardEndpointFactory::new();
    let (fb, mut incoming_b) = StandardEndpointFactory::new();
    let (left, right) = tokio::join!(
        UplinkSession::connect(a, "left", no_heartbeat(), Arc::new(fa)),
        UplinkSession::accept(b, "right", no_heartbeat(), Arc::new(fb)),
    );
    let (left, right) = (left.unwrap(), right.unwrap());

    let exec = ChannelKind::Execution {
        role: ExecutionRole::Initiator,
    };
    let from_left = left.open_channel(ChannelOpenRequest::new(exec, "run-1")).unwrap();
    let from_right = right.open_channel(file_channel("log.txt")).unwrap();
    assert_eq!(from_left.id() % 2, 1);
    assert_eq!(from_right.id() % 2, 0);

    let mut at_right = within(incoming_b.recv()).await.unwrap();
    let mut at_left = within(incoming_a.recv()).await.unwrap();
    assert_eq!(at_right.id(), from_left.id());
    assert_eq!(at_right.kind(), exec);
    assert_eq!(at_right.label(), "run-1");
    assert_eq!(at_left.kind(), ChannelKind::FileTransfer);

    at_right.send(Bytes::from_static(b"started")).unwrap();
    from_right.send(Bytes::from_static(b"line 1")).unwrap();

    let mut from_left = from_left;
    assert!(matches!(
        within(from_left.recv()).await,
        Some(ChannelDelivery::Data(d)) if d.as_ref() == b"started"
    ));
    assert!(matches!(
        within(at_left.recv()).await,
        Some(ChannelDelivery::Data(d)) if d.as_ref() == b"line 1"
    ));

    from_left.close();
    assert!(matches!(
        within(at_right.recv()).await,
        Some(ChannelDelivery::Closed(DisposeReason::RemoteClose))
    ));
}

/// Messages larger than one block are fragmented and reassembled
#[tokio::test]
async fn test_large_message_on_messaging_channel() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (fa, _) = StandardEndpointFactory::new();
    let (fb, mut incoming) = StandardEndpointFactory::new();
    let config = no_heartbeat().with_max_block_payload(4096);
    let (left, right) = tokio::join!(
        UplinkSession::connect(a, "left", config.clone(), Arc::new(fa)),
        UplinkSession::accept(b, "right", config, Arc::new(fb)),
    );
    let (left, _right) = (left.unwrap(), right.unwrap());

    let channel = left
        .open_channel(ChannelOpenRequest::new(ChannelKind::Messaging, "node"))
        .unwrap();
    let message = Bytes::from((0..100_000u32).map(|i| i as u8).collect::<Vec<_>>());
    channel.send_message(&message).unwrap();
    assert!(matches!(
        channel.send(Bytes::from(vec![0u8; 5000])),
        Err(UplinkError::BlockTooLarge { size: 5000, max: 4096 })
    ));

    let mut accepted = within(incoming.recv()).await.unwrap();
    match within(accepted.recv()).await {
        Some(ChannelDelivery::Data(data)) => assert_eq!(data, message),
        other => panic!("unexpected delivery {other:?}"),
    }
}

/// Silence on the physical connection disposes every channel with one shared error
#[tokio::test(start_paused = true)]
async fn test_heartbeat_loss_surfaces_single_error() {
    let (a, mut b) = tokio::io::duplex(256 * 1024);

    // A peer that completes the handshake and then goes quiet
    let peer = tokio::spawn(async move {
        write_protocol_header(&mut b).await.unwrap();
        let hello = postcard::to_allocvec(&UplinkHandshake::new("silent-relay")).unwrap();
        write_block(
            &mut b,
            &MessageBlock::new(0, BlockType::Handshake, hello),
            MAX_BLOCK_PAYLOAD,
        )
        .await
        .unwrap();
        b.flush().await.unwrap();
        read_protocol_header(&mut b).await.unwrap();
        let block = read_block(&mut b, MAX_BLOCK_PAYLOAD).await.unwrap();
        assert_eq!(block.block_type, BlockType::Handshake);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        drop(b);
    });

    let config = UplinkConfig::default().with_heartbeat(Duration::from_secs(1), Duration::from_secs(3));
    let (factory, _) = StandardEndpointFactory::new();
    let session = UplinkSession::connect(a, "client", config, Arc::new(factory))
        .await
        .unwrap();
    assert_eq!(session.remote_name(), "silent-relay");

    let mut first = session.open_channel(file_channel("a")).unwrap();
    let mut second = session
        .open_channel(ChannelOpenRequest::new(
            ChannelKind::Execution {
                role: ExecutionRole::Provider,
            },
            "b",
        ))
        .unwrap();

    session.closed().await;
    let shared = session.close_error().expect("session should have failed");
    assert!(matches!(*shared, UplinkError::RelayConnectionLost(_)));

    for channel in [&mut first, &mut second] {
        match channel.recv().await {
            Some(ChannelDelivery::Closed(DisposeReason::RelayConnectionLost(error))) => {
                assert!(Arc::ptr_eq(&error, &shared));
            }
            other => panic!("unexpected delivery {other:?}"),
        }
    }
    assert!(matches!(
        session.open_channel(file_channel("c")),
        Err(UplinkError::RelayConnectionLost(_))
    ));
    peer.abort();
}

/// GOODBYE closes the remote session cleanly
#[tokio::test]
async fn test_goodbye_is_clean() {
    let mut h = harness(no_heartbeat()).await;
    let _fast = h.client.open_channel(file_channel("fast")).unwrap();
    h.client.close();

    within(h.relay.closed()).await;
    assert!(h.relay.close_error().is_none());
    let (label, reason) = within(h.disposed.recv()).await.unwrap();
    assert_eq!(label, "fast");
    assert!(matches!(reason, DisposeReason::SessionClosed));
}

/// Node channels over a real uplink connection
#[tokio::test]
async fn test_provider_over_loopback() {
    let provider = |name: &str| {
        let (forwarder, rx) = ChannelEventForwarder::new();
        let info = HandshakeInfo::new(InstanceNodeId::generate().new_session(), name);
        let context = TransportContext::new(info, Arc::new(forwarder));
        (UplinkTransportProvider::new(context, UplinkConfig::default()), rx)
    };
    let (relay, mut relay_rx) = provider("relay");
    let (client, mut client_rx) = provider("client");

    let bound = relay
        .create_channel_endpoint(&NetworkContactPoint::any_port("uplink", "127.0.0.1").unwrap())
        .await
        .unwrap();
    let channel = client.connect(&bound).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Established);
    assert_eq!(channel.transport_id(), "uplink");
    assert_eq!(channel.remote_display_name(), "relay");

    let ChannelEvent::Established(relay_end) = within(relay_rx.recv()).await.unwrap() else {
        panic!("expected established event on relay");
    };
    assert_eq!(relay_end.remote_display_name(), "client");
    assert!(matches!(
        within(client_rx.recv()).await,
        Some(ChannelEvent::Established(_))
    ));

    let big = Bytes::from(vec![0xA5u8; 1024 * 1024]);
    channel.send(big.clone()).await.unwrap();
    channel.send(Bytes::from_static(b"after")).await.unwrap();
    match within(relay_rx.recv()).await.unwrap() {
        ChannelEvent::Message(_, payload) => assert_eq!(payload, big),
        other => panic!("unexpected event {other:?}"),
    }
    match within(relay_rx.recv()).await.unwrap() {
        ChannelEvent::Message(_, payload) => assert_eq!(payload.as_ref(), b"after"),
        other => panic!("unexpected event {other:?}"),
    }

    relay_end.send(Bytes::from_static(b"pong")).await.unwrap();
    assert!(matches!(
        within(client_rx.recv()).await,
        Some(ChannelEvent::Message(_, p)) if p.as_ref() == b"pong"
    ));

    channel.close().await;
    match within(relay_rx.recv()).await.unwrap() {
        ChannelEvent::Closed(_, reason) => assert!(reason.is_clean(), "{reason}"),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(
        within(client_rx.recv()).await,
        Some(ChannelEvent::Closed(_, overlink_core::CloseReason::Local))
    ));

    client.shutdown().await;
    relay.shutdown().await;
}

fn named_provider(
    name: &str,
    config: UplinkConfig,
) -> (UplinkTransportProvider, mpsc::UnboundedReceiver<ChannelEvent>) {
    let (forwarder, rx) = ChannelEventForwarder::new();
    let info = HandshakeInfo::new(InstanceNodeId::generate().new_session(), name);
    let context = TransportContext::new(info, Arc::new(forwarder));
    (UplinkTransportProvider::new(context, config), rx)
}

async fn wait_for_namespace(relay: &UplinkRelay, namespace: &str, assigned: bool) {
    within(async {
        while relay.is_namespace_assigned(namespace) != assigned {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

/// Two clients talk through a relay; only the relay is dialled
#[tokio::test]
async fn test_relay_echo_between_clients() {
    let relay = UplinkRelay::new("relay", UplinkConfig::default());
    let address = relay.listen("127.0.0.1:0").await.unwrap();
    let relay_cp = NetworkContactPoint::any_port("uplink", "127.0.0.1")
        .unwrap()
        .with_port(address.port())
        .unwrap();

    let (server, mut server_rx) =
        named_provider("server", UplinkConfig::default().with_namespace("site-b"));
    let (client, mut client_rx) = named_provider("client", UplinkConfig::default());
    server.attach_relay(&relay_cp).await.unwrap();
    wait_for_namespace(&relay, "site-b", true).await;

    let channel = client.connect_via_relay(&relay_cp, "site-b/node").await.unwrap();
    assert_eq!(channel.state(), ChannelState::Established);
    assert_eq!(channel.remote_display_name(), "server");
    assert_eq!(relay.forwarded_channels(), 1);

    let ChannelEvent::Established(server_end) = within(server_rx.recv()).await.unwrap() else {
        panic!("expected established event on server");
    };
    assert_eq!(server_end.remote_display_name(), "client");
    assert!(matches!(
        within(client_rx.recv()).await,
        Some(ChannelEvent::Established(_))
    ));

    // Fragments pass the relay untouched and are reassembled at the far end
    let big = Bytes::from((0..300_000u32).map(|i| i as u8).collect::<Vec<_>>());
    for message in [Bytes::from_static(b"ping"), big] {
        channel.send(message.clone()).await.unwrap();
        let received = match within(server_rx.recv()).await.unwrap() {
            ChannelEvent::Message(_, payload) => payload,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(received, message);
        server_end.send(received).await.unwrap();
        match within(client_rx.recv()).await.unwrap() {
            ChannelEvent::Message(_, payload) => assert_eq!(payload, message),
            other => panic!("unexpected event {other:?}"),
        }
    }

    // Unknown and self addressed destinations are refused; the relay
    // session is shared by every attempt
    assert!(client.connect_via_relay(&relay_cp, "site-x/node").await.is_err());
    assert!(server.connect_via_relay(&relay_cp, "site-b").await.is_err());
    assert_eq!(client.session_count(), 1);
    assert_eq!(relay.session_count(), 2);

    channel.close().await;
    match within(server_rx.recv()).await.unwrap() {
        ChannelEvent::Closed(_, reason) => assert!(reason.is_clean(), "{reason}"),
        other => panic!("unexpected event {other:?}"),
    }

    client.shutdown().await;
    server.shutdown().await;
    wait_for_namespace(&relay, "site-b", false).await;
    relay.shutdown();
}

/// A namespace belongs to the first live session announcing it
#[tokio::test]
async fn test_relay_refuses_taken_namespace() {
    let relay = UplinkRelay::new("relay", no_heartbeat());
    let named = no_heartbeat().with_namespace("site-a");
    let client_session = |stream, name: &'static str| {
        let (factory, _) = StandardEndpointFactory::new();
        UplinkSession::connect(stream, name, named.clone(), Arc::new(factory))
    };

    let (a, b) = tokio::io::duplex(64 * 1024);
    let (first, accepted) = tokio::join!(client_session(a, "first"), relay.accept_session(b));
    let (first, accepted) = (first.unwrap(), accepted.unwrap());
    assert_eq!(accepted.remote_namespace(), Some("site-a"));
    assert!(relay.find_session_for_destination("site-a/worker").is_some());
    assert!(relay.find_session_for_destination("site-ab/worker").is_none());
    assert!(!relay.attempt_to_assign_namespace("bad/name", &accepted));

    let (a, b) = tokio::io::duplex(64 * 1024);
    let (second, refused) = tokio::join!(client_session(a, "second"), relay.accept_session(b));
    assert!(matches!(refused, Err(UplinkError::Handshake(_))));
    let second = second.unwrap();
    within(second.closed()).await;
    let error = second.close_error().unwrap();
    assert!(error.to_string().contains("site-a"), "{error}");

    // Released once the holder leaves
    first.close();
    wait_for_namespace(&relay, "site-a", false).await;
    assert!(relay.find_session_for_destination("site-a").is_none());
}

/// Connecting twice to one endpoint shares the physical connection
#[tokio::test]
async fn test_connect_reuses_session() {
    let (listener, mut listener_rx) = named_provider("listener", UplinkConfig::default());
    let (dialer, _dialer_rx) = named_provider("dialer", UplinkConfig::default());
    let bound = listener
        .create_channel_endpoint(&NetworkContactPoint::any_port("uplink", "127.0.0.1").unwrap())
        .await
        .unwrap();

    let first = dialer.connect(&bound).await.unwrap();
    let second = dialer.connect(&bound).await.unwrap();
    assert_ne!(first.channel_id(), second.channel_id());
    assert_eq!(dialer.session_count(), 1);
    assert_eq!(dialer.channel_count(), 2);

    for _ in 0..2 {
        assert!(matches!(
            within(listener_rx.recv()).await,
            Some(ChannelEvent::Established(_))
        ));
    }
    assert_eq!(listener.session_count(), 1);

    // Closing one channel leaves the session to the other
    first.close().await;
    second.send(Bytes::from_static(b"still here")).await.unwrap();
    let mut got_message = false;
    while !got_message {
        match within(listener_rx.recv()).await.unwrap() {
            ChannelEvent::Message(_, payload) => {
                assert_eq!(payload.as_ref(), b"still here");
                got_message = true;
            }
            ChannelEvent::Closed(..) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(dialer.session_count(), 1);

    dialer.shutdown().await;
    listener.shutdown().await;
}
