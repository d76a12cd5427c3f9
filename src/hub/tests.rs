use super::*;
use crate::protocol::handshake::HandshakeRequest;
use crate::protocol::{MessageType, StreamInvocationMessage};
use rmpv::Value;
use std::sync::atomic::{AtomicUsize, Ordering};

// ── Registry ────────────────────────────────────────────────────────────────

fn registry() -> ConnectionRegistry {
    ConnectionRegistry::new(Duration::from_millis(50))
}

fn connected_handle(
    registry: &ConnectionRegistry,
    id: &str,
    capacity: usize,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = Arc::new(ConnectionHandle::new(id, tx));
    assert!(handle.mark_connected());
    registry.add(handle);
    rx
}

fn frame(text: &'static str) -> Bytes {
    Bytes::from_static(text.as_bytes())
}

#[test]
fn test_join_is_idempotent() {
    let registry = registry();
    let _rx = connected_handle(&registry, "a", 4);

    assert!(registry.join("a", "auction-1"));
    assert!(registry.join("a", "auction-1"));

    assert_eq!(registry.members_of("auction-1"), vec!["a".to_string()]);
    assert_eq!(registry.groups_of("a"), vec!["auction-1".to_string()]);
    assert_eq!(registry.group_count(), 1);
}

#[test]
fn test_join_requires_connected_connection() {
    let registry = registry();
    assert!(!registry.join("ghost", "auction-1"));

    let (tx, _rx) = mpsc::channel(1);
    registry.add(Arc::new(ConnectionHandle::new("pending", tx)));
    assert!(!registry.join("pending", "auction-1"));
    assert_eq!(registry.group_count(), 0);
}

#[test]
fn test_leave_drops_empty_groups() {
    let registry = registry();
    let _a = connected_handle(&registry, "a", 4);
    let _b = connected_handle(&registry, "b", 4);
    registry.join("a", "auction-1");
    registry.join("b", "auction-1");

    assert!(registry.leave("a", "auction-1"));
    assert!(!registry.leave("a", "auction-1"));
    assert_eq!(registry.members_of("auction-1"), vec!["b".to_string()]);
    assert!(registry.groups_of("a").is_empty());

    assert!(registry.leave("b", "auction-1"));
    assert_eq!(registry.group_count(), 0);
}

#[test]
fn test_remove_clears_memberships_and_is_idempotent() {
    let registry = registry();
    let _a = connected_handle(&registry, "a", 4);
    registry.join("a", "auction-1");
    registry.join("a", "auction-2");

    let removed = registry.remove("a").expect("registered");
    assert_eq!(removed.state(), ConnectionState::Disconnected);
    assert!(registry.remove("a").is_none());
    assert_eq!(registry.group_count(), 0);
    assert_eq!(registry.connection_count(), 0);
    assert!(registry.groups_of("a").is_empty());
}

#[tokio::test]
async fn test_broadcast_all_skips_connecting() {
    let registry = registry();
    let mut a = connected_handle(&registry, "a", 4);
    let (tx, mut pending) = mpsc::channel(4);
    registry.add(Arc::new(ConnectionHandle::new("pending", tx)));

    let delivery = registry.broadcast_all(frame("hello")).await;
    assert_eq!(delivery, Delivery { delivered: 1, failed: 0 });
    assert_eq!(a.recv().await.unwrap(), frame("hello"));
    assert!(pending.try_recv().is_err());
}

#[tokio::test]
async fn test_broadcast_group_reaches_only_current_members() {
    let registry = registry();
    let mut a = connected_handle(&registry, "a", 4);
    let mut b = connected_handle(&registry, "b", 4);
    let mut c = connected_handle(&registry, "c", 4);
    let mut outsider = connected_handle(&registry, "d", 4);
    registry.join("a", "auction-5");
    registry.join("b", "auction-5");
    registry.join("c", "auction-5");

    registry.remove("c");

    let delivery = registry.broadcast_group("auction-5", frame("bid")).await;
    assert_eq!(delivery.delivered, 2);
    assert_eq!(a.recv().await.unwrap(), frame("bid"));
    assert_eq!(b.recv().await.unwrap(), frame("bid"));
    assert!(c.try_recv().is_err());
    assert!(outsider.try_recv().is_err());
}

#[tokio::test]
async fn test_broadcast_to_empty_group_is_noop() {
    let registry = registry();
    let delivery = registry.broadcast_group("auction-404", frame("x")).await;
    assert_eq!(delivery.targets(), 0);
}

#[tokio::test]
async fn test_others_in_group_excludes_sender() {
    let registry = registry();
    let mut a = connected_handle(&registry, "a", 4);
    let mut b = connected_handle(&registry, "b", 4);
    registry.join("a", "auction-1");
    registry.join("b", "auction-1");

    let delivery = registry
        .broadcast_others_in_group("auction-1", "a", frame("outbid"))
        .await;
    assert_eq!(delivery.delivered, 1);
    assert!(a.try_recv().is_err());
    assert_eq!(b.recv().await.unwrap(), frame("outbid"));
}

#[tokio::test]
async fn test_outbid_then_disconnect_scenario() {
    let registry = registry();
    let mut a = connected_handle(&registry, "a", 4);
    let mut b = connected_handle(&registry, "b", 4);
    registry.join("a", "auction-1");
    registry.join("b", "auction-1");

    registry
        .broadcast_others_in_group("auction-1", "a", frame("M"))
        .await;
    assert_eq!(b.recv().await.unwrap(), frame("M"));
    assert!(a.try_recv().is_err());

    registry.remove("a");
    let delivery = registry.broadcast_group("auction-1", frame("M2")).await;
    assert_eq!(delivery, Delivery { delivered: 1, failed: 0 });
    assert_eq!(b.recv().await.unwrap(), frame("M2"));
    assert!(a.try_recv().is_err());
}

#[tokio::test]
async fn test_stalled_connection_does_not_block_others() {
    let registry = registry();
    // Capacity 1 and never drained: the second send waits for the timeout
    let _stalled = connected_handle(&registry, "stalled", 1);
    let mut healthy = connected_handle(&registry, "healthy", 4);

    registry.broadcast_all(frame("first")).await;
    let delivery = registry.broadcast_all(frame("second")).await;

    assert_eq!(delivery, Delivery { delivered: 1, failed: 1 });
    assert_eq!(healthy.recv().await.unwrap(), frame("first"));
    assert_eq!(healthy.recv().await.unwrap(), frame("second"));
}

#[tokio::test]
async fn test_closed_queue_is_counted_as_failure() {
    let registry = registry();
    let closed = connected_handle(&registry, "closed", 4);
    let mut open = connected_handle(&registry, "open", 4);
    drop(closed);

    let delivery = registry.broadcast_all(frame("x")).await;
    assert_eq!(delivery, Delivery { delivered: 1, failed: 1 });
    assert_eq!(open.recv().await.unwrap(), frame("x"));
}

#[tokio::test]
async fn test_disconnected_handle_refuses_frames() {
    let (tx, mut rx) = mpsc::channel(4);
    let handle = ConnectionHandle::new("a", tx);
    handle.mark_connected();
    handle.mark_disconnected();

    let result = handle.send(frame("late"), Duration::from_millis(10)).await;
    assert_eq!(result, Err(SendError::NotConnected));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_state_transitions() {
    let (tx, _rx) = mpsc::channel(1);
    let handle = ConnectionHandle::new("a", tx);
    assert_eq!(handle.state(), ConnectionState::Connecting);
    assert!(handle.mark_connected());
    assert!(!handle.mark_connected());
    assert_eq!(handle.mark_disconnected(), ConnectionState::Connected);
    assert_eq!(handle.mark_disconnected(), ConnectionState::Disconnected);
    // Disconnected is terminal
    assert!(!handle.mark_connected());
}

#[tokio::test]
async fn test_connection_age_counts_from_accept() {
    let before = chrono::Utc::now();
    let (tx, _rx) = mpsc::channel(1);
    let handle = ConnectionHandle::new("a", tx);
    assert!(handle.connected_at() >= before);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(handle.open_for() >= chrono::Duration::milliseconds(20));
    assert!(handle.connected_at() <= chrono::Utc::now());
}

// ── Hub ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct TestHandler {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

#[async_trait]
impl HubHandler for TestHandler {
    async fn on_connected(&self, _ctx: &HubContext) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_disconnected(&self, _ctx: &HubContext) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_invocation(
        &self,
        ctx: &HubContext,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<Option<Value>, InvocationError> {
        match target {
            "Echo" => Ok(arguments.into_iter().next()),
            "Void" => Ok(None),
            "Join" => {
                let group = arguments
                    .first()
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                ctx.groups().add_to_group(ctx.connection_id(), &group);
                ctx.clients()
                    .others_in_group(group, ctx.connection_id())
                    .send("Joined", vec![Value::from(ctx.connection_id())])
                    .await?;
                Ok(None)
            }
            "Fail" => Err(InvocationError::Failed("bid rejected".to_string())),
            other => Err(InvocationError::UnknownMethod(other.to_string())),
        }
    }
}

fn test_hub() -> Hub<TestHandler> {
    let config = HubConfig {
        send_timeout_ms: 50,
        ..HubConfig::default()
    };
    Hub::new(TestHandler::default(), config)
}

fn handshake_bytes() -> Vec<u8> {
    handshake::write_request(&HandshakeRequest::messagepack()).unwrap()
}

async fn connect(hub: &Hub<TestHandler>) -> (Session, mpsc::Receiver<Bytes>) {
    let (mut session, mut rx) = hub.connect();
    let outcome = hub.on_receive(&mut session, &handshake_bytes()).await.unwrap();
    assert_eq!(outcome, ReceiveOutcome::Continue);
    assert_eq!(rx.recv().await.unwrap().as_ref(), b"{}\x1e");
    (session, rx)
}

fn invoke(invocation: InvocationMessage) -> Bytes {
    MessagePackHubProtocol::write_message(&HubMessage::Invocation(invocation)).unwrap()
}

fn single_message(frame: &Bytes) -> HubMessage {
    let mut messages = MessagePackHubProtocol::parse_messages(frame).unwrap();
    assert_eq!(messages.len(), 1);
    messages.remove(0)
}

fn completion(frame: &Bytes) -> CompletionMessage {
    match single_message(frame) {
        HubMessage::Completion(completion) => completion,
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_handshake_connects_session() {
    let hub = test_hub();
    let (session, _rx) = connect(&hub).await;

    assert!(session.is_connected());
    assert_eq!(hub.registry().connection_count(), 1);
    assert_eq!(hub.handler().connected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handshake_split_across_messages() {
    let hub = test_hub();
    let (mut session, mut rx) = hub.connect();
    let bytes = handshake_bytes();
    let (head, tail) = bytes.split_at(10);

    hub.on_receive(&mut session, head).await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connecting);
    assert!(rx.try_recv().is_err());

    hub.on_receive(&mut session, tail).await.unwrap();
    assert!(session.is_connected());
    assert_eq!(rx.recv().await.unwrap().as_ref(), b"{}\x1e");
}

#[tokio::test]
async fn test_messages_after_handshake_in_same_buffer() {
    let hub = test_hub();
    let (mut session, mut rx) = hub.connect();

    let mut data = handshake_bytes();
    data.extend_from_slice(&invoke(InvocationMessage::with_id("1", "Void", vec![])));
    hub.on_receive(&mut session, &data).await.unwrap();

    assert_eq!(rx.recv().await.unwrap().as_ref(), b"{}\x1e");
    let done = completion(&rx.recv().await.unwrap());
    assert_eq!(done, CompletionMessage::void("1"));
}

#[tokio::test]
async fn test_unsupported_protocol_is_rejected() {
    let hub = test_hub();
    let (mut session, mut rx) = hub.connect();

    let request = HandshakeRequest {
        protocol: "json".to_string(),
        version: 1,
    };
    let bytes = handshake::write_request(&request).unwrap();
    let err = hub.on_receive(&mut session, &bytes).await.unwrap_err();
    assert!(matches!(err, HubError::Handshake(_)));
    assert!(err.close_reason().is_none());

    let response = rx.recv().await.unwrap();
    let (parsed, _) = handshake::parse_response(&response).unwrap().unwrap();
    assert_eq!(
        parsed.error.as_deref(),
        Some("The protocol 'json' is not supported.")
    );
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_invocation_completions() {
    let hub = test_hub();
    let (mut session, mut rx) = connect(&hub).await;

    let echo = InvocationMessage::with_id("1", "Echo", vec![Value::from(42)]);
    hub.on_receive(&mut session, &invoke(echo)).await.unwrap();
    assert_eq!(
        completion(&rx.recv().await.unwrap()),
        CompletionMessage::with_result("1", Value::from(42))
    );

    let fail = InvocationMessage::with_id("2", "Fail", vec![]);
    hub.on_receive(&mut session, &invoke(fail)).await.unwrap();
    assert_eq!(
        completion(&rx.recv().await.unwrap()),
        CompletionMessage::with_error("2", "bid rejected")
    );

    let unknown = InvocationMessage::with_id("3", "Nope", vec![]);
    hub.on_receive(&mut session, &invoke(unknown)).await.unwrap();
    assert_eq!(
        completion(&rx.recv().await.unwrap()).error.as_deref(),
        Some("Unknown hub method 'Nope'")
    );
}

#[tokio::test]
async fn test_invocation_without_id_gets_no_completion() {
    let hub = test_hub();
    let (mut session, mut rx) = connect(&hub).await;

    hub.on_receive(&mut session, &invoke(InvocationMessage::new("Fail", vec![])))
        .await
        .unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_stream_invocation_is_rejected_with_completion() {
    let hub = test_hub();
    let (mut session, mut rx) = connect(&hub).await;

    let message = HubMessage::StreamInvocation(StreamInvocationMessage {
        headers: Default::default(),
        invocation_id: "9".to_string(),
        target: "Counter".to_string(),
        arguments: vec![],
        stream_ids: None,
    });
    let frame = MessagePackHubProtocol::write_message(&message).unwrap();
    hub.on_receive(&mut session, &frame).await.unwrap();

    let done = completion(&rx.recv().await.unwrap());
    assert_eq!(done.invocation_id, "9");
    assert!(done.error.is_some());
}

#[tokio::test]
async fn test_hub_method_broadcasts_to_group() {
    let hub = test_hub();
    let (mut a, mut a_rx) = connect(&hub).await;
    let (mut b, mut b_rx) = connect(&hub).await;

    let join = |group: &str| invoke(InvocationMessage::new("Join", vec![Value::from(group)]));

    hub.on_receive(&mut a, &join("auction-1")).await.unwrap();
    // Nobody else in the group yet
    assert!(b_rx.try_recv().is_err());

    hub.on_receive(&mut b, &join("auction-1")).await.unwrap();
    match single_message(&a_rx.recv().await.unwrap()) {
        HubMessage::Invocation(invocation) => {
            assert_eq!(invocation.target, "Joined");
            assert_eq!(invocation.arguments, vec![Value::from(b.id())]);
            assert!(invocation.invocation_id.is_none());
        }
        other => panic!("expected invocation, got {:?}", other),
    }
    assert!(b_rx.try_recv().is_err());
    assert_eq!(
        hub.registry().members_of("auction-1").len(),
        2
    );
}

#[tokio::test]
async fn test_ping_is_accepted() {
    let hub = test_hub();
    let (mut session, mut rx) = connect(&hub).await;

    let outcome = hub
        .on_receive(&mut session, &MessagePackHubProtocol::ping_frame())
        .await
        .unwrap();
    assert_eq!(outcome, ReceiveOutcome::Continue);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_close_message_ends_connection() {
    let hub = test_hub();
    let (mut session, _rx) = connect(&hub).await;

    let close = MessagePackHubProtocol::write_message(&HubMessage::Close(CloseMessage::default()))
        .unwrap();
    let outcome = hub.on_receive(&mut session, &close).await.unwrap();
    assert_eq!(outcome, ReceiveOutcome::Closed);
}

#[tokio::test]
async fn test_malformed_frame_is_fatal() {
    let hub = test_hub();
    let (mut session, _rx) = connect(&hub).await;

    let err = hub
        .on_receive(&mut session, &[0x05, 0x91])
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Framing(FramingError::IncompleteMessage)));
    assert!(err.close_reason().unwrap().contains("incomplete message"));
}

#[tokio::test]
async fn test_invalid_payload_is_fatal() {
    let hub = test_hub();
    let (mut session, _rx) = connect(&hub).await;

    // Framed empty array
    let err = hub
        .on_receive(&mut session, &[0x01, 0x90])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HubError::Protocol(ProtocolError::InvalidPayload(_))
    ));
}

#[tokio::test]
async fn test_oversized_message_is_rejected() {
    let config = HubConfig {
        max_message_size: 8,
        ..HubConfig::default()
    };
    let hub = Hub::new(TestHandler::default(), config);
    let (mut session, _rx) = hub.connect();

    let err = hub
        .on_receive(&mut session, &[0u8; 9])
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::MessageTooLarge { size: 9, limit: 8 }));
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_leaves_groups() {
    let hub = test_hub();
    let (mut a, _a_rx) = connect(&hub).await;
    hub.on_receive(
        &mut a,
        &invoke(InvocationMessage::new("Join", vec![Value::from("auction-3")])),
    )
    .await
    .unwrap();
    assert_eq!(hub.registry().groups_of(a.id()), vec!["auction-3".to_string()]);

    hub.disconnect(&a).await;
    hub.disconnect(&a).await;

    assert_eq!(hub.handler().disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(hub.registry().connection_count(), 0);
    assert_eq!(hub.registry().group_count(), 0);

    let err = hub
        .on_receive(&mut a, &MessagePackHubProtocol::ping_frame())
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::UnknownConnection(_)));
}

#[tokio::test]
async fn test_disconnect_before_handshake_skips_callback() {
    let hub = test_hub();
    let (session, _rx) = hub.connect();
    hub.disconnect(&session).await;

    assert_eq!(hub.handler().disconnected.load(Ordering::SeqCst), 0);
    assert_eq!(hub.registry().connection_count(), 0);
}

#[tokio::test]
async fn test_clients_proxy_encodes_invocation_once_per_send() {
    let hub = test_hub();
    let (_a, mut a_rx) = connect(&hub).await;
    let (_b, mut b_rx) = connect(&hub).await;

    let delivery = hub
        .clients()
        .all()
        .send("ReceiveNewAuction", vec![Value::from("lamp")])
        .await
        .unwrap();
    assert_eq!(delivery.delivered, 2);

    let a_frame = a_rx.recv().await.unwrap();
    let b_frame = b_rx.recv().await.unwrap();
    assert_eq!(a_frame, b_frame);
    assert_eq!(single_message(&a_frame).message_type(), MessageType::Invocation);
}
