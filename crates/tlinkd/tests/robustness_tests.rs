//! Robustness tests for the daemon socket.
//!
//! These tests verify the daemon handles edge cases and error conditions gracefully:
//! - Malformed and unknown requests get an error reply on a live connection
//! - Message size limits
//! - Rapid connect/disconnect
//! - Concurrent clients
//! - Recovery after errors
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tlink_core::{IpcEndpoint, RoutingKey, SessionId, SessionMode, SessionRegistration};
use tlink_protocol::{ClientMessage, DaemonMessage, ErrorCode};
use tlinkd::registry::{spawn_registry, RegistryConfig};
use tlinkd::server::DaemonServer;
use tlinkd::store::SessionStore;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

// ============================================================================
// Test Helpers
// ============================================================================

struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    temp_dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("tlinkd.sock");

        let store = SessionStore::in_memory().expect("in-memory store");
        let registry = spawn_registry(store, RegistryConfig::default());
        let cancel_token = CancellationToken::new();

        let server = DaemonServer::new(socket_path.clone(), registry, cancel_token.clone());

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT {
            if socket_path.exists() {
                break;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }

        assert!(socket_path.exists(), "Server socket did not appear");

        TestServer {
            socket_path,
            cancel_token,
            temp_dir,
        }
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.writer.write_all(json.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn send_raw(&mut self, data: &[u8]) {
        self.writer.write_all(data).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> DaemonMessage {
        self.recv_timeout(Duration::from_secs(2))
            .await
            .expect("reply within timeout")
    }

    async fn recv_timeout(&mut self, duration: Duration) -> Option<DaemonMessage> {
        match timeout(duration, async {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.ok()?;
            if n == 0 {
                return None;
            }
            serde_json::from_str(&line).ok()
        })
        .await
        {
            Ok(Some(msg)) => Some(msg),
            _ => None,
        }
    }

    /// True once the daemon has closed its end.
    async fn is_closed(&mut self) -> bool {
        let mut line = String::new();
        loop {
            line.clear();
            match timeout(Duration::from_secs(2), self.reader.read_line(&mut line)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    async fn handshake(&mut self, client_id: Option<String>) -> String {
        self.send(ClientMessage::connect(client_id)).await;
        match self.recv().await {
            DaemonMessage::Connected { client_id, .. } => client_id,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    async fn expect_pong(&mut self, seq: u64) {
        self.send(ClientMessage::ping(seq)).await;
        match self.recv().await {
            DaemonMessage::Pong { seq: got } => assert_eq!(got, seq),
            other => panic!("Expected Pong, got {other:?}"),
        }
    }
}

// ============================================================================
// Malformed Message Tests
// ============================================================================

#[tokio::test]
async fn test_malformed_json_before_handshake_does_not_crash() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send_raw(b"this is not valid json\n").await;
    sleep(Duration::from_millis(50)).await;

    let mut client2 = server.connect().await;
    client2.handshake(Some("after-malformed".to_string())).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_json_gets_error_and_connection_continues() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    client.send_raw(b"{not json at all\n").await;
    match client.recv().await {
        DaemonMessage::Error { code, .. } => assert_eq!(code, ErrorCode::Protocol),
        other => panic!("Expected Error, got {other:?}"),
    }

    client.expect_pong(7).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_message_type_gets_error() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    let unknown = r#"{"protocol_version":{"major":1,"minor":0},"type":"teleport","where":"mars"}"#;
    client.send_raw(unknown.as_bytes()).await;
    client.send_raw(b"\n").await;

    match client.recv().await {
        DaemonMessage::Error { code, .. } => assert_eq!(code, ErrorCode::Protocol),
        other => panic!("Expected Error, got {other:?}"),
    }
    client.expect_pong(1).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_missing_fields_get_error() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    // `send` without a payload
    let partial = r#"{"protocol_version":{"major":1,"minor":0},"type":"send","session_id":"s1"}"#;
    client.send_raw(partial.as_bytes()).await;
    client.send_raw(b"\n").await;

    assert!(matches!(
        client.recv().await,
        DaemonMessage::Error {
            code: ErrorCode::Protocol,
            ..
        }
    ));
    client.expect_pong(2).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_empty_line_gets_error() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    client.send_raw(b"\n").await;
    assert!(matches!(client.recv().await, DaemonMessage::Error { .. }));
    client.expect_pong(3).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_registration_is_rejected_not_fatal() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    // Channel mode with a thread routing key
    let reg = SessionRegistration::new(
        server.temp_dir.path(),
        SessionMode::Channel,
        RoutingKey::thread("C1", "100.0"),
        IpcEndpoint::new(server.temp_dir.path().join("s.sock")),
    );
    client.send(ClientMessage::register(reg)).await;
    match client.recv().await {
        DaemonMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRequest),
        other => panic!("Expected Error, got {other:?}"),
    }

    client.expect_pong(4).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_second_connect_is_protocol_error() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    client.send(ClientMessage::connect(None)).await;
    assert!(matches!(
        client.recv().await,
        DaemonMessage::Error {
            code: ErrorCode::Protocol,
            ..
        }
    ));

    server.shutdown().await;
}

// ============================================================================
// Message Size Limit Tests
// ============================================================================

#[tokio::test]
async fn test_oversized_message_closes_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    // Larger than MAX_MESSAGE_SIZE (1 MiB)
    let large_payload = "x".repeat(2 * 1024 * 1024);
    let large_json = format!(
        r#"{{"protocol_version":{{"major":1,"minor":0}},"type":"send","session_id":"s1","payload":"{large_payload}"}}"#
    );

    // The daemon may stop reading before the write completes.
    let _ = client.writer.write_all(large_json.as_bytes()).await;
    let _ = client.writer.write_all(b"\n").await;
    let _ = client.writer.flush().await;

    assert!(client.is_closed().await, "oversize request should close the connection");

    let mut client2 = server.connect().await;
    client2.handshake(None).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_large_but_allowed_payload_is_processed() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    // Well under the limit; the session does not exist, so NotFound comes back.
    client
        .send(ClientMessage::send(SessionId::new("s1"), "y".repeat(200 * 1024)))
        .await;
    match client.recv().await {
        DaemonMessage::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
        other => panic!("Expected Error, got {other:?}"),
    }

    server.shutdown().await;
}

// ============================================================================
// Rapid Connect/Disconnect Tests
// ============================================================================

#[tokio::test]
async fn test_rapid_connect_disconnect() {
    let server = TestServer::spawn().await;

    for i in 0..20 {
        let mut client = server.connect().await;
        client.handshake(Some(format!("rapid-{i}"))).await;
        client.send(ClientMessage::disconnect()).await;
    }

    sleep(Duration::from_millis(100)).await;

    let mut final_client = server.connect().await;
    let id = final_client.handshake(Some("final".to_string())).await;
    assert_eq!(id, "final");

    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_without_handshake() {
    let server = TestServer::spawn().await;

    for _ in 0..10 {
        let client = server.connect().await;
        drop(client);
    }
    sleep(Duration::from_millis(50)).await;

    let mut client = server.connect().await;
    client.handshake(None).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_many_concurrent_connections() {
    let server = TestServer::spawn().await;

    let mut handles = Vec::new();
    for i in 0..20u64 {
        let socket_path = server.socket_path.clone();
        let handle = tokio::spawn(async move {
            let stream = UnixStream::connect(&socket_path).await.unwrap();
            let mut client = TestClient::new(stream);
            let id = client.handshake(Some(format!("concurrent-{i}"))).await;
            assert_eq!(id, format!("concurrent-{i}"));

            client.send(ClientMessage::list(None)).await;
            assert!(matches!(
                client.recv().await,
                DaemonMessage::SessionList { .. }
            ));

            client.expect_pong(i).await;
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.await.expect("concurrent connection should succeed");
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_subscriber_disconnect_does_not_break_broadcast() {
    let server = TestServer::spawn().await;

    let mut gone = server.connect().await;
    gone.handshake(None).await;
    gone.send(ClientMessage::subscribe(None)).await;
    gone.recv().await;
    drop(gone);

    let mut watcher = server.connect().await;
    watcher.handshake(None).await;
    watcher.send(ClientMessage::subscribe(None)).await;
    watcher.recv().await;

    let mut control = server.connect().await;
    control.handshake(None).await;
    let reg = SessionRegistration::new(
        server.temp_dir.path(),
        SessionMode::Channel,
        RoutingKey::channel("C9"),
        IpcEndpoint::new(server.temp_dir.path().join("s.sock")),
    );
    control.send(ClientMessage::register(reg)).await;
    assert!(matches!(control.recv().await, DaemonMessage::Session { .. }));

    assert!(matches!(
        watcher.recv_timeout(Duration::from_secs(2)).await,
        Some(DaemonMessage::SessionUpdated { .. })
    ));

    server.shutdown().await;
}
