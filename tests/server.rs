use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use rust_server_echo::{ConfigError, Logger, Message, Server, ServerConfig, ServerError, ShutdownPhase};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

fn test_config(max_connections: usize) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        max_connections,
        read_timeout: Duration::from_secs(10),
        write_timeout: Duration::from_secs(10),
        ..ServerConfig::default()
    }
}

async fn start(config: ServerConfig) -> (Server, SocketAddr) {
    let server = Server::new(config, Logger);
    let addr = server.start().await.expect("server should bind");
    (server, addr)
}

struct Client {
    reader: BufReader<TcpStream>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            reader: BufReader::new(stream),
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.reader.get_mut().write_all(bytes).await.expect("write");
    }

    async fn send(&mut self, msg: &Value) {
        let mut line = serde_json::to_vec(msg).unwrap();
        line.push(b'\n');
        self.send_raw(&line).await;
    }

    /// Next line, or `None` if the server closed (or reset) the connection.
    async fn recv_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    }

    async fn recv(&mut self) -> Value {
        let line = timeout(Duration::from_secs(5), self.recv_line())
            .await
            .expect("response in time")
            .expect("connection open");
        serde_json::from_str(&line).expect("valid JSON response")
    }

    async fn round_trip(&mut self, id: &str) -> Value {
        self.send(&json!({ "id": id, "type": "data", "source": "test", "payload": {} }))
            .await;
        self.recv().await
    }

    /// True if the server ends the connection within `wait`.
    async fn closed_within(&mut self, wait: Duration) -> bool {
        matches!(timeout(wait, self.recv_line()).await, Ok(None))
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn echoes_message_with_server_receive_time() {
    let (server, addr) = start(test_config(8)).await;
    let mut client = Client::connect(addr).await;

    let before = Utc::now();
    client
        .send(&json!({"id":"m1","type":"data","source":"c1","payload":{"v":1}}))
        .await;
    let reply = client.recv().await;
    let after = Utc::now();

    assert_eq!(reply["id"], "m1");
    assert_eq!(reply["type"], "data");
    assert_eq!(reply["source"], "c1");
    assert_eq!(reply["payload"], json!({"v": 1}));

    let decoded: Message = serde_json::from_value(reply).unwrap();
    assert!(decoded.time >= before && decoded.time <= after);

    server.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn one_response_per_request_on_a_single_connection() {
    let (server, addr) = start(test_config(8)).await;
    let mut client = Client::connect(addr).await;

    for i in 0..5 {
        let id = format!("m{}", i);
        let reply = client.round_trip(&id).await;
        assert_eq!(reply["id"], id.as_str());
    }

    server.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn truncated_frame_closes_only_that_connection() {
    let (server, addr) = start(test_config(8)).await;
    let mut healthy = Client::connect(addr).await;
    let mut broken = Client::connect(addr).await;
    healthy.round_trip("before").await;

    broken.send_raw(br#"{"id":"m1","type":"da"#).await;
    broken.reader.get_mut().shutdown().await.unwrap();
    assert!(broken.closed_within(Duration::from_secs(2)).await);

    let reply = healthy.round_trip("after").await;
    assert_eq!(reply["id"], "after");

    server.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn malformed_line_closes_the_connection() {
    let (server, addr) = start(test_config(8)).await;
    let mut client = Client::connect(addr).await;

    client.send_raw(b"this is not json\n").await;
    assert!(client.closed_within(Duration::from_secs(2)).await);
    wait_until(|| server.active_connections() == 0).await;

    server.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn oversized_frame_closes_the_connection() {
    let mut config = test_config(8);
    config.max_frame_bytes = 16;
    let (server, addr) = start(config).await;
    let mut client = Client::connect(addr).await;

    client
        .send(&json!({ "id": "a-very-long-identifier", "payload": "x".repeat(64) }))
        .await;
    assert!(client.closed_within(Duration::from_secs(2)).await);

    server.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn idle_connection_is_dropped_after_read_timeout() {
    let mut config = test_config(8);
    config.read_timeout = Duration::from_millis(200);
    let (server, addr) = start(config).await;
    let mut client = Client::connect(addr).await;

    assert!(client.closed_within(Duration::from_secs(3)).await);
    wait_until(|| server.active_connections() == 0).await;

    server.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn all_connections_up_to_capacity_are_served() {
    let (server, addr) = start(test_config(4)).await;

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(Client::connect(addr).await);
    }
    for (i, client) in clients.iter_mut().enumerate() {
        let reply = client.round_trip(&format!("c{}", i)).await;
        assert_eq!(reply["id"], format!("c{}", i).as_str());
    }
    assert_eq!(server.active_connections(), 4);

    server.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn connection_over_capacity_waits_for_a_free_slot() {
    let (server, addr) = start(test_config(1)).await;

    let mut first = Client::connect(addr).await;
    first.round_trip("a1").await;

    // The OS completes the handshake, but the server does not accept it yet.
    let mut second = Client::connect(addr).await;
    second
        .send(&json!({"id":"b1","type":"data","source":"b","payload":null}))
        .await;
    let held = timeout(Duration::from_millis(300), second.recv_line()).await;
    assert!(held.is_err(), "second client must not be served while the first holds the slot");
    assert_eq!(server.active_connections(), 1);

    drop(first);

    let reply = second.recv().await;
    assert_eq!(reply["id"], "b1");

    server.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn shutdown_force_closes_every_open_connection() {
    let (server, addr) = start(test_config(8)).await;

    let mut clients = Vec::new();
    for i in 0..3 {
        let mut client = Client::connect(addr).await;
        client.round_trip(&format!("s{}", i)).await;
        clients.push(client);
    }
    assert_eq!(server.active_connections(), 3);

    let report = server.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(report.closed, 3);
    assert!(report.close_failures.is_empty());
    assert!(report.drained);
    assert_eq!(server.phase(), ShutdownPhase::Stopped);
    assert_eq!(server.active_connections(), 0);

    for client in clients.iter_mut() {
        assert!(client.closed_within(Duration::from_secs(2)).await);
    }

    // Listener is gone.
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn backlogged_connection_is_never_accepted_after_shutdown() {
    let (server, addr) = start(test_config(1)).await;

    let mut holder = Client::connect(addr).await;
    holder.round_trip("h").await;

    let mut waiting = Client::connect(addr).await;
    waiting
        .send(&json!({"id":"w","type":"data","source":"w","payload":null}))
        .await;

    server.shutdown(Duration::from_secs(5)).await.unwrap();

    let outcome = timeout(Duration::from_secs(2), waiting.recv_line()).await;
    assert!(matches!(outcome, Ok(None)), "backlogged client must see termination, not a reply");
}

#[tokio::test]
async fn second_shutdown_is_a_no_op() {
    let (server, addr) = start(test_config(8)).await;
    let mut client = Client::connect(addr).await;
    client.round_trip("x").await;

    let first = server.shutdown(Duration::from_secs(2)).await.unwrap();
    assert_eq!(first.closed, 1);

    let second = server.shutdown(Duration::from_secs(2)).await.unwrap();
    assert_eq!(second.closed, 0);
    assert!(!second.drained);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_reports_deadline_exceeded_when_a_session_outlives_it() {
    let entered = Arc::new(AtomicBool::new(false));
    let transform = {
        let entered = Arc::clone(&entered);
        Arc::new(move |msg: Message| {
            entered.store(true, Ordering::SeqCst);
            // Park this worker without stalling the timer driver.
            tokio::task::block_in_place(|| std::thread::sleep(Duration::from_millis(1500)));
            msg
        })
    };

    let server = Server::with_transform(test_config(8), Logger, transform);
    let addr = server.start().await.unwrap();
    let mut client = Client::connect(addr).await;
    client
        .send(&json!({"id":"slow","type":"data","source":"c","payload":null}))
        .await;
    wait_until(|| entered.load(Ordering::SeqCst)).await;

    let err = server.shutdown(Duration::from_millis(200)).await.unwrap_err();
    match err {
        ServerError::DeadlineExceeded { outstanding, .. } => assert_eq!(outstanding, 1),
        other => panic!("expected DeadlineExceeded, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn without_waiting_shutdown_returns_once_closes_are_issued() {
    let entered = Arc::new(AtomicBool::new(false));
    let transform = {
        let entered = Arc::clone(&entered);
        Arc::new(move |msg: Message| {
            entered.store(true, Ordering::SeqCst);
            // Park this worker without stalling the timer driver.
            tokio::task::block_in_place(|| std::thread::sleep(Duration::from_millis(800)));
            msg
        })
    };

    let mut config = test_config(8);
    config.wait_for_sessions = false;
    let server = Server::with_transform(config, Logger, transform);
    let addr = server.start().await.unwrap();
    let mut client = Client::connect(addr).await;
    client
        .send(&json!({"id":"slow","type":"data","source":"c","payload":null}))
        .await;
    wait_until(|| entered.load(Ordering::SeqCst)).await;

    let report = server.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(report.closed, 1);
    assert!(!report.drained);
    // The session is still inside its transform, so it has not deregistered.
    assert_eq!(server.active_connections(), 1);
}

#[tokio::test]
async fn start_rejects_double_start_and_start_after_shutdown() {
    let (server, _addr) = start(test_config(2)).await;
    assert!(matches!(server.start().await, Err(ServerError::AlreadyStarted)));

    server.shutdown(Duration::from_secs(1)).await.unwrap();
    assert!(matches!(server.start().await, Err(ServerError::ShuttingDown)));
}

#[tokio::test]
async fn bind_failure_is_reported() {
    let (first, addr) = start(test_config(2)).await;

    let mut config = test_config(2);
    config.port = addr.port();
    let second = Server::new(config, Logger);
    assert!(matches!(second.start().await, Err(ServerError::Bind { .. })));

    first.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn start_rejects_an_invalid_config() {
    let server = Server::new(test_config(0), Logger);
    assert!(matches!(
        server.start().await,
        Err(ServerError::Config(ConfigError::Invalid(_)))
    ));
    assert_eq!(server.local_addr(), None);

    if let Ok(too_many) = usize::try_from(u64::from(u32::MAX) + 1) {
        let server = Server::new(test_config(too_many), Logger);
        assert!(matches!(server.start().await, Err(ServerError::Config(_))));
    }

    let mut config = test_config(4);
    config.max_frame_bytes = 0;
    let server = Server::new(config, Logger);
    assert!(matches!(server.start().await, Err(ServerError::Config(_))));
}
