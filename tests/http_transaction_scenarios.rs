//! S3 (chunked 200 decoded) and S2 (NTLM-authenticated request through a
//! proxy) driven through the real `UserAgent`/`HttpTransaction` pipeline
//! against loopback fixture servers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axeda_agent::http::request::{Request, RequestHandler};
use axeda_agent::http::transaction::ProxyAuthConfig;
use axeda_agent::user_agent::UserAgent;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Default)]
struct RecordingHandler {
    chunks: Mutex<Vec<Bytes>>,
    completed_status: Mutex<Option<u16>>,
}

#[async_trait]
impl RequestHandler for RecordingHandler {
    async fn on_entity(&self, _offset: u64, chunk: Bytes) -> bool {
        self.chunks.lock().await.push(chunk);
        true
    }

    async fn on_completed(&self, status: u16, _headers: Vec<(String, String)>) {
        *self.completed_status.lock().await = Some(status);
    }

    async fn on_error(&self, error: axeda_agent::error::AxedaError) {
        panic!("unexpected transport error: {error}");
    }
}

#[tokio::test]
async fn chunked_response_is_decoded_into_entity_callbacks() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            socket.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
            if buf.ends_with(b"\r\n\r\n") {
                break;
            }
        }

        socket
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n")
            .await
            .unwrap();
    });

    let user_agent = UserAgent::new(Duration::from_secs(2));
    let handler = Arc::new(RecordingHandler::default());
    let req = Request::get("127.0.0.1", addr.port(), "/");
    user_agent.submit(req, handler.clone()).await;

    tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();

    let chunks = handler.chunks.lock().await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(&chunks[0][..], b"hello");
    assert_eq!(&chunks[1][..], b" world");
    let total: usize = chunks.iter().map(Bytes::len).sum();
    assert_eq!(total, 11);
    assert_eq!(*handler.completed_status.lock().await, Some(200));
}

async fn read_request_head(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        socket.read_exact(&mut byte).await.unwrap();
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// A minimal, 32-byte NTLM Type-2 challenge with an empty target name, enough
/// for `auth::parse_ntlm_type2` to accept.
fn ntlm_type2_fixture() -> String {
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(b"NTLMSSP\0");
    msg.extend_from_slice(&2u32.to_le_bytes());
    msg.extend_from_slice(&0u16.to_le_bytes()); // target name length
    msg.extend_from_slice(&0u16.to_le_bytes()); // target name max length
    msg.extend_from_slice(&32u32.to_le_bytes()); // target name offset
    msg.extend_from_slice(&0u32.to_le_bytes()); // flags
    msg.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // server challenge
    BASE64.encode(msg)
}

#[tokio::test]
async fn ntlm_authenticated_request_through_proxy_completes_in_two_authenticated_rounds() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        // Bare probe: the proxy doesn't know yet that NTLM will be used.
        let probe = read_request_head(&mut socket).await;
        assert!(probe.starts_with("GET http://example:80/x HTTP/1.1\r\n"));
        socket
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        // Round 1: Type-1 negotiate, kept alive via Proxy-Connection.
        let round1 = read_request_head(&mut socket).await;
        assert!(round1.contains("Proxy-Authorization: NTLM "));
        assert!(round1.contains("Proxy-Connection: Keep-Alive\r\n"));
        let challenge = ntlm_type2_fixture();
        socket
            .write_all(
                format!(
                    "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM {challenge}\r\nContent-Length: 0\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        // Round 2: Type-3 authenticate, same connection.
        let round2 = read_request_head(&mut socket).await;
        assert!(round2.contains("Proxy-Authorization: NTLM "));
        socket.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await.unwrap();
    });

    let user_agent = UserAgent::new(Duration::from_secs(2))
        .with_http_proxy("127.0.0.1", addr.port(), ProxyAuthConfig { user: Some("u".to_string()), password: Some("p".to_string()) });
    let handler = Arc::new(RecordingHandler::default());
    let req = Request::get("example", 80, "/x");
    user_agent.submit(req, handler.clone()).await;

    tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
    assert_eq!(*handler.completed_status.lock().await, Some(200));
}
