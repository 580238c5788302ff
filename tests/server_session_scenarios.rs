//! S1 (simple ping) driven through the real `ServerSession` tick loop against
//! a loopback HTTP fixture server, following the teacher's integration-test
//! pattern of exercising the public API over a real socket rather than
//! mocking the transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axeda_agent::domain_types::{DeviceId, EMessageByteBudget, PingIntervalMs, QueueByteBudget, RetryDelayMs, ServerConfigId};
use axeda_agent::error::AxedaError;
use axeda_agent::queue::MessageQueue;
use axeda_agent::server_session::{ServerSession, ServerSessionCallbacks, ServerSessionConfig};
use axeda_agent::soap::{CommandResult, SoapCommandHandler, SoapDispatcher};
use axeda_agent::user_agent::UserAgent;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Reads one HTTP/1.1 request head + body off `socket` and returns the body.
async fn read_request_body(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        socket.read_exact(&mut byte).await.unwrap();
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let head = String::from_utf8_lossy(&buf);
    let content_length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length:").or_else(|| line.strip_prefix("content-length:")))
        .map(|v| v.trim().parse().unwrap_or(0))
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        socket.read_exact(&mut body).await.unwrap();
    }
    body
}

async fn respond_200_empty(socket: &mut tokio::net::TcpStream) {
    socket
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
}

struct NoopSoap;
#[async_trait]
impl SoapCommandHandler for NoopSoap {
    async fn set_tag(&self, _n: &str, _v: &str) -> CommandResult {
        CommandResult::ok()
    }
    async fn set_time(&self, _t: &str) -> CommandResult {
        CommandResult::ok()
    }
    async fn restart(&self, _h: bool) -> CommandResult {
        CommandResult::ok()
    }
    async fn file_transfer_start(&self, _a: &std::collections::HashMap<String, String>) -> CommandResult {
        CommandResult::ok()
    }
    async fn file_transfer_stop(&self, _a: &std::collections::HashMap<String, String>) -> CommandResult {
        CommandResult::ok()
    }
    async fn file_transfer_pause(&self, _a: &std::collections::HashMap<String, String>) -> CommandResult {
        CommandResult::ok()
    }
    async fn remote_session_start(&self, _a: &std::collections::HashMap<String, String>) -> CommandResult {
        CommandResult::ok()
    }
    async fn catch_all(&self, _m: &str, _a: &std::collections::HashMap<String, String>) -> CommandResult {
        CommandResult::ok()
    }
}

struct CapturingCallbacks {
    errors: Mutex<Vec<String>>,
    rate_updates: Mutex<Vec<PingIntervalMs>>,
}

#[async_trait]
impl ServerSessionCallbacks for CapturingCallbacks {
    async fn on_ping_rate_update(&self, new_interval: PingIntervalMs) {
        self.rate_updates.lock().await.push(new_interval);
    }
    async fn on_web_error(&self, error: AxedaError) {
        self.errors.lock().await.push(error.to_string());
    }
}

#[tokio::test]
async fn simple_ping_tick_posts_one_emessage_containing_pi_element() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut bodies = Vec::new();
        for _ in 0..2 {
            let (mut socket, _) = listener.accept().await.unwrap();
            let body = read_request_body(&mut socket).await;
            respond_200_empty(&mut socket).await;
            bodies.push(body);
        }
        bodies
    });

    let queue = MessageQueue::new(QueueByteBudget::try_new(65_536).unwrap());
    let user_agent = Arc::new(UserAgent::new(Duration::from_secs(2)));
    let soap = Arc::new(SoapDispatcher::new(Arc::new(NoopSoap), queue.clone()));
    let callbacks = Arc::new(CapturingCallbacks { errors: Mutex::new(Vec::new()), rate_updates: Mutex::new(Vec::new()) });

    let config = ServerSessionConfig {
        device_id: DeviceId::new(0),
        server_config_id: ServerConfigId::new(0),
        device_model_number: "model".to_string(),
        device_serial_number: "serial".to_string(),
        device_owner: "owner".to_string(),
        post_host: "127.0.0.1".to_string(),
        post_port: addr.port(),
        post_path: "/eMessage".to_string(),
        post_tls: false,
        content_type: "text/xml".to_string(),
        emessage_budget: EMessageByteBudget::try_new(65_536).unwrap(),
        ping_interval: PingIntervalMs::new(1),
        min_retry_delay: RetryDelayMs::new(1),
        max_retry_delay: RetryDelayMs::new(1_000),
    };
    let session = ServerSession::new(config, queue.clone(), user_agent, soap, callbacks.clone());

    // First tick: unregistered, sends the registration EMessage.
    session.tick(false).await;
    // Second tick: now registered; ping interval has elapsed, so this delivers
    // the ping-bearing EMessage the scenario is about.
    tokio::time::sleep(Duration::from_millis(5)).await;
    session.tick(true).await;

    let bodies = tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
    assert_eq!(bodies.len(), 2);
    let ping_body = String::from_utf8_lossy(&bodies[1]);
    assert!(ping_body.contains("<Pi t="), "expected a <Pi> ping element, got: {ping_body}");
    assert!(callbacks.errors.lock().await.is_empty(), "expected no web errors");
}

#[tokio::test]
async fn registration_response_with_rate_update_invokes_callback_and_adopts_new_interval() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request_body(&mut socket).await;
        let response_body = br#"<Re r="120" t="systime" y="0"/>"#;
        socket
            .write_all(
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    response_body.len()
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        socket.write_all(response_body).await.unwrap();
    });

    let queue = MessageQueue::new(QueueByteBudget::try_new(65_536).unwrap());
    let user_agent = Arc::new(UserAgent::new(Duration::from_secs(2)));
    let soap = Arc::new(SoapDispatcher::new(Arc::new(NoopSoap), queue.clone()));
    let callbacks = Arc::new(CapturingCallbacks { errors: Mutex::new(Vec::new()), rate_updates: Mutex::new(Vec::new()) });

    let config = ServerSessionConfig {
        device_id: DeviceId::new(0),
        server_config_id: ServerConfigId::new(0),
        device_model_number: "model".to_string(),
        device_serial_number: "serial".to_string(),
        device_owner: "owner".to_string(),
        post_host: "127.0.0.1".to_string(),
        post_port: addr.port(),
        post_path: "/eMessage".to_string(),
        post_tls: false,
        content_type: "text/xml".to_string(),
        emessage_budget: EMessageByteBudget::try_new(65_536).unwrap(),
        ping_interval: PingIntervalMs::new(10_000),
        min_retry_delay: RetryDelayMs::new(1),
        max_retry_delay: RetryDelayMs::new(1_000),
    };
    let session = ServerSession::new(config, queue.clone(), user_agent, soap, callbacks.clone());

    session.tick(false).await;
    tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();

    let updates = callbacks.rate_updates.lock().await;
    assert_eq!(updates.as_slice(), &[PingIntervalMs::new(120_000)]);
}
