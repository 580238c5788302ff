//! C11 transport: a remote session carries its frame stream either over one
//! persistent direct TCP connection or, when direct connectivity fails, over
//! a pair of long-poll HTTP requests (§4.11 "tries direct; if that fails,
//! falls back to HTTP long-poll; never interleaves the two within one
//! session").
//!
//! [`Transport`] is a tagged enum rather than a trait object, per §9's
//! preference for match-dispatch over type erasure when the two arms have
//! meaningfully different lifetimes and resource shapes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::connection::Connection;
use crate::error::{AxedaError, TransportError};
use crate::http::request::{Request, RequestHandler};
use crate::remote_session::wire::{self, Frame, HEADER_LEN};
use crate::user_agent::UserAgent;

/// Preamble sent once at the start of a direct connection, ahead of the
/// framed stream (§4.11 "identifies itself with a short preamble before the
/// first frame").
const PREAMBLE_VERSION: u8 = 1;

/// One established carrier for a remote session's frame stream.
pub enum Transport {
    Direct(DirectTransport),
    Http(HttpTransport),
}

impl Transport {
    /// Tries a direct connection first; on any transport-level failure, falls
    /// back to the HTTP long-poll carrier (§4.11).
    #[instrument(skip(user_agent, session_id))]
    pub async fn establish(
        host: &str,
        port: u16,
        tls: bool,
        path: &str,
        session_id: &str,
        user_agent: Arc<UserAgent>,
        timeout: Duration,
    ) -> Result<Self, AxedaError> {
        match DirectTransport::connect(host, port, tls, session_id, timeout).await {
            Ok(direct) => Ok(Transport::Direct(direct)),
            Err(_) => Ok(Transport::Http(HttpTransport::new(
                host.to_string(),
                port,
                tls,
                path.to_string(),
                session_id.to_string(),
                user_agent,
            ))),
        }
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), AxedaError> {
        match self {
            Transport::Direct(d) => d.send_frame(frame).await,
            Transport::Http(h) => h.send_frame(frame).await,
        }
    }

    /// Blocks (direct) or long-polls (HTTP) until at least one frame is available.
    pub async fn receive_frames(&mut self) -> Result<Vec<Frame>, AxedaError> {
        match self {
            Transport::Direct(d) => d.receive_frame().await.map(|f| vec![f]),
            Transport::Http(h) => h.poll().await,
        }
    }
}

/// One persistent TCP (optionally TLS) connection carrying the frame stream
/// directly, reusing [`Connection`] (C1) rather than re-implementing socket
/// and TLS-upgrade plumbing.
pub struct DirectTransport {
    conn: Connection,
}

impl DirectTransport {
    async fn connect(host: &str, port: u16, tls: bool, session_id: &str, timeout: Duration) -> Result<Self, AxedaError> {
        let mut conn = Connection::new(0, host.to_string(), port, host.to_string(), port, timeout);
        conn.connect().await?;
        if tls {
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|_| TransportError::BadUrl(host.to_string()))?;
            let roots = rustls::RootCertStore::empty();
            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
            conn.enable_tls(&connector, server_name).await?;
        }

        let id_bytes = session_id.as_bytes();
        let mut preamble = BytesMut::with_capacity(2 + id_bytes.len());
        preamble.extend_from_slice(&[PREAMBLE_VERSION, u8::try_from(id_bytes.len()).unwrap_or(u8::MAX)]);
        preamble.extend_from_slice(id_bytes);
        conn.send(preamble.freeze(), true).await?;

        Ok(Self { conn })
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), AxedaError> {
        let wire = frame.encode().map_err(AxedaError::Internal)?;
        self.conn.send(wire, true).await?;
        Ok(())
    }

    async fn receive_frame(&mut self) -> Result<Frame, AxedaError> {
        let header_bytes = self.conn.receive(HEADER_LEN, true).await?;
        let header = Frame::parse_header(&header_bytes).map_err(AxedaError::Internal)?;
        let padded = header.padded_len();
        let body = if padded == 0 {
            Bytes::new()
        } else {
            let raw = self.conn.receive(padded, true).await?;
            raw.slice(0..header.length)
        };
        Frame::from_header_and_body(header, body).map_err(AxedaError::Internal)
    }
}

/// Fallback carrier: outbound frames are POSTed one at a time, inbound frames
/// arrive batched in the body of a long-poll GET that the server holds open
/// until it has data (or a keepalive timeout elapses) (§4.11).
pub struct HttpTransport {
    host: String,
    port: u16,
    tls: bool,
    path: String,
    session_id: String,
    user_agent: Arc<UserAgent>,
}

impl HttpTransport {
    #[must_use]
    pub fn new(host: String, port: u16, tls: bool, path: String, session_id: String, user_agent: Arc<UserAgent>) -> Self {
        Self { host, port, tls, path, session_id, user_agent }
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), AxedaError> {
        let wire = frame.encode().map_err(AxedaError::Internal)?;
        let handler = Arc::new(BufferingHandler::default());
        let req = Request::post(self.host.clone(), self.port, format!("{}?session={}&dir=send", self.path, self.session_id), wire, "application/octet-stream")
            .with_tls(self.tls);
        self.user_agent.submit(req, handler.clone()).await;
        handler.into_result().map(|_| ())
    }

    async fn poll(&mut self) -> Result<Vec<Frame>, AxedaError> {
        let handler = Arc::new(BufferingHandler::default());
        let req = Request::get(self.host.clone(), self.port, format!("{}?session={}&dir=poll", self.path, self.session_id))
            .with_tls(self.tls);
        self.user_agent.submit(req, handler.clone()).await;
        let body = handler.into_result()?;
        let mut buf = BytesMut::from(&body[..]);
        wire::decode_all(&mut buf).map_err(AxedaError::Internal)
    }
}

/// Accumulates a response body for the half-duplex HTTP carrier, mirroring
/// [`crate::server_session::CapturingHandler`]'s shape.
#[derive(Default)]
struct BufferingHandler {
    body: AsyncMutex<Vec<u8>>,
    status: AsyncMutex<Option<u16>>,
    error: AsyncMutex<Option<AxedaError>>,
}

impl BufferingHandler {
    fn into_result(self: Arc<Self>) -> Result<Bytes, AxedaError> {
        if let Some(err) = self.error.try_lock().ok().and_then(|mut e| e.take()) {
            return Err(err);
        }
        let status = self.status.try_lock().ok().and_then(|s| *s).unwrap_or(0);
        if !(200..300).contains(&status) {
            return Err(AxedaError::Http(crate::error::HttpError::BadResponse(format!(
                "remote-session HTTP transport received status {status}"
            ))));
        }
        Ok(self.body.try_lock().map(|b| Bytes::from(b.clone())).unwrap_or_default())
    }
}

#[async_trait]
impl RequestHandler for BufferingHandler {
    async fn on_entity(&self, _offset: u64, chunk: Bytes) -> bool {
        self.body.lock().await.extend_from_slice(&chunk);
        true
    }

    async fn on_completed(&self, status: u16, _headers: Vec<(String, String)>) {
        *self.status.lock().await = Some(status);
    }

    async fn on_error(&self, error: AxedaError) {
        *self.error.lock().await = Some(error);
    }
}
