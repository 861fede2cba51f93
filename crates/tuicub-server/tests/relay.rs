use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tuicub_core::messages::DisconnectCallback;
use tuicub_core::{ConnectionId, DisconnectReason, Event, SessionId, SharedSecret, Topic};
use tuicub_server::{
    start, CallbackError, CallbackTransport, HttpCallbackTransport, NotifyOutcome, RetryPolicy,
    ServerConfig, ServerHandle,
};
use tuicub_telemetry::RelayMetrics;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(5);

// ── Fixtures ────────────────────────────────────────────────────────────────

/// Fails the first `failures` calls, then succeeds.
#[derive(Default)]
struct RecordingTransport {
    failures: AtomicU32,
    calls: AtomicU32,
    seen: Mutex<Vec<DisconnectCallback>>,
}

impl RecordingTransport {
    fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU32::new(failures),
            ..Default::default()
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallbackTransport for RecordingTransport {
    async fn notify(&self, callback: &DisconnectCallback) -> Result<(), CallbackError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(callback.clone());
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(CallbackError::Status(503));
        }
        Ok(())
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        events_addr: "127.0.0.1:0".into(),
        messages_addr: "127.0.0.1:0".into(),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
        },
        ..ServerConfig::default()
    }
}

async fn start_relay(config: ServerConfig, transport: Arc<dyn CallbackTransport>) -> ServerHandle {
    start(config, transport, Arc::new(RelayMetrics::new()))
        .await
        .unwrap()
}

struct LineConn {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl LineConn {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn send(&mut self, value: &Value) {
        self.send_raw(&value.to_string()).await;
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    /// True if the peer closed (or reset) the connection.
    async fn closed(&mut self) -> bool {
        matches!(
            tokio::time::timeout(WAIT, self.lines.next_line()).await,
            Ok(Ok(None)) | Ok(Err(_))
        )
    }
}

struct Publisher {
    conn: LineConn,
    digest: String,
}

impl Publisher {
    async fn connect(relay: &ServerHandle) -> Self {
        Self {
            conn: LineConn::connect(relay.messages_addr()).await,
            digest: SharedSecret::new("changeme").digest(),
        }
    }

    async fn request(&mut self, message: Value) -> Value {
        let envelope = json!({"token": self.digest, "message": message});
        self.conn.send(&envelope).await;
        self.conn.recv().await
    }

    async fn open_session(&mut self, token: &str, session: &str, topics: &[&str]) {
        let ack = self
            .request(json!({"op": "open_session", "token": token, "session_id": session, "topics": topics}))
            .await;
        assert_eq!(ack, json!({"ok": true}));
    }
}

async fn connect_client(relay: &ServerHandle, token: &str) -> LineConn {
    let before = relay.registry().len();
    let mut client = LineConn::connect(relay.events_addr()).await;
    client.send(&json!({"token": token})).await;
    wait_for(|| relay.registry().len() > before).await;
    client
}

async fn wait_for(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_outcome(outcomes: &mut tokio::sync::broadcast::Receiver<NotifyOutcome>) -> NotifyOutcome {
    tokio::time::timeout(WAIT, outcomes.recv())
        .await
        .expect("timed out waiting for a notify outcome")
        .unwrap()
}

// ── Fan-out ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn published_event_reaches_subscribed_client() {
    let relay = start_relay(test_config(), Arc::new(RecordingTransport::default())).await;
    let mut publisher = Publisher::connect(&relay).await;
    publisher.open_session("tok-1", "sess_1", &["game-1"]).await;
    let mut client = connect_client(&relay, "tok-1").await;

    let ack = publisher
        .request(json!({"op": "publish", "topic": "game-1", "name": "turn_started", "data": {"turn": 1}}))
        .await;
    assert_eq!(ack, json!({"ok": true, "delivered": 1}));
    assert_eq!(client.recv().await, json!({"name": "turn_started", "data": {"turn": 1}}));

    relay.join().await;
}

#[tokio::test]
async fn events_arrive_in_publish_order() {
    let relay = start_relay(test_config(), Arc::new(RecordingTransport::default())).await;
    let mut publisher = Publisher::connect(&relay).await;
    publisher.open_session("tok-1", "sess_1", &["game-1", "lobby"]).await;
    let mut client = connect_client(&relay, "tok-1").await;

    for i in 0..50 {
        let topic = if i % 3 == 0 { "lobby" } else { "game-1" };
        publisher
            .request(json!({"op": "publish", "topic": topic, "name": "tick", "data": i}))
            .await;
    }
    for i in 0..50 {
        assert_eq!(client.recv().await["data"], json!(i));
    }

    relay.join().await;
}

#[tokio::test]
async fn personal_topic_targets_one_session() {
    let relay = start_relay(test_config(), Arc::new(RecordingTransport::default())).await;
    let mut publisher = Publisher::connect(&relay).await;
    publisher.open_session("tok-a", "sess_a", &["lobby"]).await;
    publisher.open_session("tok-b", "sess_b", &["lobby"]).await;
    let mut a = connect_client(&relay, "tok-a").await;
    let mut b = connect_client(&relay, "tok-b").await;

    let ack = publisher
        .request(json!({"op": "publish", "topic": "session:sess_b", "name": "whisper"}))
        .await;
    assert_eq!(ack["delivered"], 1);
    publisher
        .request(json!({"op": "publish", "topic": "lobby", "name": "everyone"}))
        .await;

    assert_eq!(a.recv().await["name"], "everyone");
    assert_eq!(b.recv().await["name"], "whisper");
    assert_eq!(b.recv().await["name"], "everyone");

    relay.join().await;
}

#[tokio::test]
async fn session_subscribe_applies_to_live_connection() {
    let relay = start_relay(test_config(), Arc::new(RecordingTransport::default())).await;
    let mut publisher = Publisher::connect(&relay).await;
    publisher.open_session("tok-1", "sess_1", &[]).await;
    let mut client = connect_client(&relay, "tok-1").await;

    let ack = publisher
        .request(json!({"op": "subscribe", "session_id": "sess_1", "topic": "game-9"}))
        .await;
    assert_eq!(ack, json!({"ok": true}));
    publisher
        .request(json!({"op": "publish", "topic": "game-9", "name": "started"}))
        .await;
    assert_eq!(client.recv().await["name"], "started");

    relay.join().await;
}

// ── Authentication ──────────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_secret_delivers_nothing() {
    let relay = start_relay(test_config(), Arc::new(RecordingTransport::default())).await;
    let mut publisher = Publisher::connect(&relay).await;
    publisher.open_session("tok-1", "sess_1", &["game-1"]).await;
    let mut client = connect_client(&relay, "tok-1").await;

    let forged = json!({
        "token": SharedSecret::new("not-the-secret").digest(),
        "message": {"op": "publish", "topic": "game-1", "name": "forged"}
    });
    publisher.conn.send(&forged).await;
    assert_eq!(
        publisher.conn.recv().await,
        json!({"ok": false, "error": "auth_rejected"})
    );

    publisher
        .request(json!({"op": "publish", "topic": "game-1", "name": "genuine"}))
        .await;
    assert_eq!(client.recv().await["name"], "genuine");
    assert_eq!(relay.metrics().snapshot().auth_rejected, 1);

    relay.join().await;
}

#[tokio::test]
async fn unknown_token_is_rejected_and_registry_unchanged() {
    let relay = start_relay(test_config(), Arc::new(RecordingTransport::default())).await;

    let mut client = LineConn::connect(relay.events_addr()).await;
    client.send(&json!({"token": "abc"})).await;
    assert!(client.closed().await);

    wait_for(|| relay.metrics().snapshot().handshakes_rejected == 1).await;
    assert_eq!(relay.registry().len(), 0);
    assert_eq!(relay.registry().topic_count(), 0);

    relay.join().await;
}

#[tokio::test]
async fn garbage_handshake_is_rejected() {
    let relay = start_relay(test_config(), Arc::new(RecordingTransport::default())).await;

    let mut client = LineConn::connect(relay.events_addr()).await;
    client.send_raw("hello?").await;
    assert!(client.closed().await);
    assert_eq!(relay.registry().len(), 0);

    relay.join().await;
}

#[tokio::test]
async fn handshake_times_out() {
    let config = ServerConfig {
        handshake_timeout: Duration::from_millis(50),
        ..test_config()
    };
    let relay = start_relay(config, Arc::new(RecordingTransport::default())).await;

    let mut client = LineConn::connect(relay.events_addr()).await;
    assert!(client.closed().await);
    wait_for(|| relay.metrics().snapshot().handshakes_rejected == 1).await;

    relay.join().await;
}

#[tokio::test]
async fn malformed_publisher_frame_keeps_connection() {
    let relay = start_relay(test_config(), Arc::new(RecordingTransport::default())).await;
    let mut publisher = Publisher::connect(&relay).await;

    publisher.conn.send_raw("this is not json").await;
    assert_eq!(
        publisher.conn.recv().await,
        json!({"ok": false, "error": "malformed_frame"})
    );

    let ack = publisher
        .request(json!({"op": "publish", "topic": "nobody", "name": "x"}))
        .await;
    assert_eq!(ack, json!({"ok": true, "delivered": 0}));

    relay.join().await;
}

#[tokio::test]
async fn repeated_auth_failures_close_publisher() {
    let config = ServerConfig {
        max_auth_failures: 3,
        ..test_config()
    };
    let relay = start_relay(config, Arc::new(RecordingTransport::default())).await;
    let mut conn = LineConn::connect(relay.messages_addr()).await;

    for _ in 0..3 {
        conn.send(&json!({"token": "bad", "message": {"op": "close_session", "token": "t"}}))
            .await;
        assert_eq!(conn.recv().await["error"], "auth_rejected");
    }
    assert!(conn.closed().await);

    relay.join().await;
}

// ── Backpressure ────────────────────────────────────────────────────────────

#[tokio::test]
async fn overflowing_client_is_dropped_others_still_served() {
    let config = ServerConfig {
        queue_capacity: 2,
        ..test_config()
    };
    let relay = start_relay(config, Arc::new(RecordingTransport::default())).await;
    let session_a = SessionId::from_raw("sess_a");
    let session_b = SessionId::from_raw("sess_b");
    let topic = Topic::new("game-1").unwrap();

    // Registered directly so nothing drains A's queue.
    let stalled = relay.registry().register(session_a, [topic.clone()]);
    let mut healthy = relay.registry().register(session_b, [topic.clone()]);
    let mut outcomes = relay.subscribe_outcomes();
    let router = relay.router();

    for i in 0..3 {
        let outcome = router
            .publish(&topic, &Event::new("tick", json!(i)))
            .unwrap();
        if i < 2 {
            assert_eq!(outcome.delivered, 2);
        } else {
            assert_eq!(outcome.delivered, 1);
            assert_eq!(outcome.overflowed, 1);
        }
        assert!(healthy.outbound.recv().await.is_some());
    }

    assert!(!relay.registry().contains(&stalled.handle));
    assert!(relay.registry().contains(&healthy.handle));
    let outcome = next_outcome(&mut outcomes).await;
    assert_eq!(outcome.connection_id(), stalled.handle.id());
    assert!(matches!(
        outcome,
        NotifyOutcome::Delivered { reason: DisconnectReason::QueueOverflow, .. }
    ));

    drop(router);
    relay.join().await;
}

/// The single connection subscribed to `topic`.
fn only_subscriber(relay: &ServerHandle, topic: &Topic) -> ConnectionId {
    let mut ids = relay.registry().subscribers(topic);
    assert_eq!(ids.len(), 1);
    ids.remove(0)
}

/// Pushes large events at `topic` until the relay drops `id`.
async fn publish_until_dropped(relay: &ServerHandle, topic: &Topic, id: &ConnectionId) {
    let router = relay.router();
    let payload = "x".repeat(32 * 1024);
    let deadline = tokio::time::Instant::now() + WAIT;
    while relay.registry().subscribers(topic).contains(id) {
        assert!(tokio::time::Instant::now() < deadline, "stalled client never dropped");
        router
            .publish(topic, &Event::new("blob", json!(payload)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_reader_is_released_and_join_completes() {
    let config = ServerConfig {
        queue_capacity: 2,
        write_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let relay = start_relay(config, Arc::new(RecordingTransport::default())).await;
    let mut outcomes = relay.subscribe_outcomes();
    let mut publisher = Publisher::connect(&relay).await;
    publisher.open_session("tok-1", "sess_1", &["game-1"]).await;
    // Handshakes, then never reads another byte.
    let _stalled = connect_client(&relay, "tok-1").await;
    let topic = Topic::new("game-1").unwrap();
    let id = only_subscriber(&relay, &topic);

    publish_until_dropped(&relay, &topic, &id).await;

    let outcome = next_outcome(&mut outcomes).await;
    assert!(matches!(
        outcome,
        NotifyOutcome::Delivered {
            reason: DisconnectReason::QueueOverflow | DisconnectReason::WriteError,
            ..
        }
    ));
    tokio::time::timeout(WAIT, relay.join())
        .await
        .expect("join blocked by a stalled client");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_write_times_out() {
    let config = ServerConfig {
        queue_capacity: 4096,
        write_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let relay = start_relay(config, Arc::new(RecordingTransport::default())).await;
    let mut outcomes = relay.subscribe_outcomes();
    let mut publisher = Publisher::connect(&relay).await;
    publisher.open_session("tok-1", "sess_1", &["game-1"]).await;
    let _stalled = connect_client(&relay, "tok-1").await;
    let topic = Topic::new("game-1").unwrap();
    let id = only_subscriber(&relay, &topic);

    publish_until_dropped(&relay, &topic, &id).await;

    assert!(matches!(
        next_outcome(&mut outcomes).await,
        NotifyOutcome::Delivered { reason: DisconnectReason::WriteError, .. }
    ));
    tokio::time::timeout(WAIT, relay.join()).await.unwrap();
}

// ── Disconnect callbacks ────────────────────────────────────────────────────

#[tokio::test]
async fn client_close_triggers_exactly_one_callback() {
    let transport = Arc::new(RecordingTransport::default());
    let relay = start_relay(test_config(), transport.clone()).await;
    let mut outcomes = relay.subscribe_outcomes();
    let mut publisher = Publisher::connect(&relay).await;
    publisher.open_session("tok-1", "sess_1", &[]).await;
    let client = connect_client(&relay, "tok-1").await;

    drop(client);
    let outcome = next_outcome(&mut outcomes).await;
    assert!(outcome.is_delivered());
    assert_eq!(outcome.attempts(), 1);
    assert_eq!(relay.registry().len(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.calls(), 1);
    assert_eq!(
        transport.seen.lock().clone(),
        vec![DisconnectCallback {
            session_id: SessionId::from_raw("sess_1"),
            reason: DisconnectReason::ClientClosed,
        }]
    );

    relay.join().await;
}

#[tokio::test]
async fn callback_retries_are_bounded() {
    let transport = RecordingTransport::failing(5);
    let relay = start_relay(test_config(), transport.clone()).await;
    let mut outcomes = relay.subscribe_outcomes();
    let mut publisher = Publisher::connect(&relay).await;
    publisher.open_session("tok-1", "sess_1", &[]).await;
    let client = connect_client(&relay, "tok-1").await;

    drop(client);
    let outcome = next_outcome(&mut outcomes).await;
    assert!(matches!(
        outcome,
        NotifyOutcome::Dropped { attempts: 3, error: CallbackError::Status(503), .. }
    ));
    assert_eq!(transport.calls(), 3);
    assert_eq!(relay.metrics().snapshot().callbacks_dropped, 1);
    // The relay keeps serving after a dropped callback.
    assert!(publisher
        .request(json!({"op": "publish", "topic": "x", "name": "y"}))
        .await["ok"]
        .as_bool()
        .unwrap());

    relay.join().await;
}

#[tokio::test]
async fn idle_client_is_swept() {
    let config = ServerConfig {
        idle_timeout: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(20),
        ..test_config()
    };
    let transport = Arc::new(RecordingTransport::default());
    let relay = start_relay(config, transport.clone()).await;
    let mut outcomes = relay.subscribe_outcomes();
    let mut publisher = Publisher::connect(&relay).await;
    publisher.open_session("tok-1", "sess_1", &[]).await;
    let mut client = connect_client(&relay, "tok-1").await;

    assert!(matches!(
        next_outcome(&mut outcomes).await,
        NotifyOutcome::Delivered { reason: DisconnectReason::IdleTimeout, .. }
    ));
    assert!(client.closed().await);

    relay.join().await;
}

#[tokio::test]
async fn shutdown_closes_clients_and_notifies() {
    let transport = Arc::new(RecordingTransport::default());
    let relay = start_relay(test_config(), transport.clone()).await;
    let mut publisher = Publisher::connect(&relay).await;
    publisher.open_session("tok-1", "sess_1", &[]).await;
    publisher.open_session("tok-2", "sess_2", &[]).await;
    let mut first = connect_client(&relay, "tok-1").await;
    let mut second = connect_client(&relay, "tok-2").await;

    tokio::time::timeout(WAIT, relay.join()).await.unwrap();
    assert!(first.closed().await);
    assert!(second.closed().await);

    let seen = transport.seen.lock().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|c| c.reason == DisconnectReason::Shutdown));
}

#[tokio::test]
async fn http_callback_end_to_end() {
    let api = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/gamerooms/disconnect"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&api)
        .await;

    let transport =
        HttpCallbackTransport::new(&api.uri(), &SharedSecret::new("changeme"), WAIT).unwrap();
    let relay = start_relay(test_config(), Arc::new(transport)).await;
    let mut outcomes = relay.subscribe_outcomes();
    let mut publisher = Publisher::connect(&relay).await;
    publisher.open_session("tok-1", "sess_1", &[]).await;
    let client = connect_client(&relay, "tok-1").await;

    drop(client);
    assert!(next_outcome(&mut outcomes).await.is_delivered());

    let requests = api.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body, json!({"session_id": "sess_1", "reason": "client_closed"}));

    relay.join().await;
}
