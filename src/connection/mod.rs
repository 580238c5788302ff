//! C1: `Connection` — one socket (plain, TLS, or SOCKS-wrapped), driven by the owning
//! task through non-blocking send/receive (§4.1).
//!
//! The spec describes a raw readiness-multiplexed socket with hand-tracked pending
//! send/receive state. The idiomatic `tokio` analog keeps the same state fields (so a
//! [`UserAgent`](crate::user_agent::UserAgent) can still ask "is this connection idle,
//! is a send still draining") but performs the actual I/O with `AsyncRead`/`AsyncWrite`
//! rather than hand-rolled `select(2)` bookkeeping.

pub mod socks;

use std::sync::Weak;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};

use crate::connection::socks::ProxyKind;
use crate::error::TransportError;

/// Lifecycle state of a [`Connection`] (§3 "Connection").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket open.
    Closed,
    /// TCP connect (and, if configured, SOCKS handshake) in flight.
    Connecting,
    /// Connected, plaintext.
    ConnectedPlain,
    /// Connected, TLS handshake complete.
    ConnectedTls,
    /// Graceful shutdown in progress.
    Closing,
}

/// Callbacks a task bound to a [`Connection`] receives (§3: "back-reference to the
/// attached task (weak — the task may outlive or predecease the connection)").
#[async_trait]
pub trait ConnectionTask: Send + Sync + std::fmt::Debug {
    /// Fired once the connection reaches `ConnectedPlain`/`ConnectedTls`.
    async fn on_connected(&self, connection_id: u64);
    /// Fired when the peer or a local error tears the connection down.
    async fn on_disconnected(&self, connection_id: u64, cause: Option<TransportError>);
    /// Fired when a queued send completes.
    async fn on_tx(&self, connection_id: u64, bytes_written: usize);
    /// Fired when requested bytes (or any available bytes, if `wait_all` was false)
    /// have arrived.
    async fn on_rx(&self, connection_id: u64, data: Bytes);
}

enum Socket {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Socket {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Socket::Plain(s) => s.write_all(buf).await,
            Socket::Tls(s) => s.write_all(buf).await,
        }
    }

    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            Socket::Plain(s) => s.read_buf(buf).await,
            Socket::Tls(s) => s.read_buf(buf).await,
        }
    }
}

/// One socket and its bookkeeping (§3 "Connection", §4.1).
pub struct Connection {
    id: u64,
    peer_host: String,
    peer_port: u16,
    origin_host: String,
    origin_port: u16,
    proxy: Option<ProxyKind>,
    state: ConnectionState,
    socket: Option<Socket>,
    timeout: Duration,
    last_activity: Instant,
    task: Option<Weak<dyn ConnectionTask>>,
    /// Bytes queued but not yet fully written (§3: "pending send queue").
    pending_send: Option<Bytes>,
    parked_idle: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &format!("{}:{}", self.peer_host, self.peer_port))
            .field("state", &self.state)
            .finish()
    }
}

impl Connection {
    /// Creates a new, unconnected `Connection` targeting `peer_host:peer_port`.
    ///
    /// `origin_host`/`origin_port` differ from the peer when a proxy sits in between
    /// (§3: "origin host/port (differ when a proxy is used)").
    #[must_use]
    pub fn new(
        id: u64,
        peer_host: impl Into<String>,
        peer_port: u16,
        origin_host: impl Into<String>,
        origin_port: u16,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            peer_host: peer_host.into(),
            peer_port,
            origin_host: origin_host.into(),
            origin_port,
            proxy: None,
            state: ConnectionState::Closed,
            socket: None,
            timeout,
            last_activity: Instant::now(),
            task: None,
            pending_send: None,
            parked_idle: false,
        }
    }

    /// Attaches a SOCKS proxy configuration; `connect()` will negotiate it before
    /// reporting `ConnectedPlain`.
    pub fn with_socks(mut self, proxy: ProxyKind) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Binds (weakly) the task that owns this connection's callbacks.
    pub fn bind_task(&mut self, task: Weak<dyn ConnectionTask>) {
        self.task = Some(task);
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn peer(&self) -> (&str, u16) {
        (&self.peer_host, self.peer_port)
    }

    #[must_use]
    pub fn origin(&self) -> (&str, u16) {
        (&self.origin_host, self.origin_port)
    }

    /// A connection may be reused serially by a new task once idle (§3).
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::ConnectedPlain | ConnectionState::ConnectedTls
        ) && self.task.as_ref().map(Weak::strong_count).unwrap_or(0) == 0
    }

    /// Parks the connection as explicitly idle, exempting it from the timeout check
    /// (§4.1: "if the connection is not explicitly parked idle, disconnect").
    pub fn park_idle(&mut self, parked: bool) {
        self.parked_idle = parked;
    }

    /// True if `now - last_activity` exceeds the configured timeout and the
    /// connection is not parked (§4.1 "Idle timeout").
    #[must_use]
    pub fn is_timed_out(&self, now: Instant) -> bool {
        !self.parked_idle
            && matches!(
                self.state,
                ConnectionState::Connecting
                    | ConnectionState::ConnectedPlain
                    | ConnectionState::ConnectedTls
            )
            && now.saturating_duration_since(self.last_activity) > self.timeout
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Resolves and connects the underlying TCP socket, negotiating a SOCKS proxy
    /// first if one was attached (§4.1 "connect()").
    #[instrument(skip(self), fields(connection_id = self.id))]
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.state = ConnectionState::Connecting;
        let target = format!("{}:{}", self.peer_host, self.peer_port);
        let stream = TcpStream::connect(&target)
            .await
            .map_err(Self::classify_connect_error)?;
        stream.set_nodelay(true).ok();

        let stream = if let Some(proxy) = self.proxy.clone() {
            socks::negotiate(stream, proxy, &self.origin_host, self.origin_port)
                .await
                .map_err(|e| TransportError::General(e.to_string()))?
        } else {
            stream
        };

        self.socket = Some(Socket::Plain(stream));
        self.state = ConnectionState::ConnectedPlain;
        self.touch();
        debug!(target = %target, "connection established");
        if let Some(task) = self.task.as_ref().and_then(Weak::upgrade) {
            task.on_connected(self.id).await;
        }
        Ok(())
    }

    fn classify_connect_error(err: std::io::Error) -> TransportError {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => TransportError::ConnectionRefused,
            ErrorKind::TimedOut => TransportError::Timeout,
            ErrorKind::NotConnected => TransportError::NotConnected,
            _ => TransportError::Io(err),
        }
    }

    /// Upgrades an already-connected plaintext socket to TLS in place (§4.1: "the
    /// 'enable-SSL' primitive must be invokable *after* `connect` completes", used
    /// by CONNECT tunneling).
    pub async fn enable_tls(
        &mut self,
        connector: &TlsConnector,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> Result<(), TransportError> {
        let Some(Socket::Plain(stream)) = self.socket.take() else {
            return Err(TransportError::NotConnected);
        };
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| TransportError::General(format!("TLS handshake failed: {e}")))?;
        self.socket = Some(Socket::Tls(Box::new(tls)));
        self.state = ConnectionState::ConnectedTls;
        self.touch();
        Ok(())
    }

    /// Writes `buf` fully. `wait_all` is retained for API fidelity with the spec's
    /// `send(buffer, length, wait_all)`; this implementation always waits for the
    /// full write to drain via `AsyncWriteExt::write_all`, which is the natural
    /// `tokio` analog of "remember how many bytes remain."
    pub async fn send(&mut self, buf: Bytes, wait_all: bool) -> Result<(), TransportError> {
        let socket = self.socket.as_mut().ok_or(TransportError::NotConnected)?;
        self.pending_send = Some(buf.clone());
        let result = socket.write_all(&buf).await;
        self.pending_send = None;
        self.touch();
        let written = result.map(|()| buf.len());
        match written {
            Ok(n) => {
                if let Some(task) = self.task.as_ref().and_then(Weak::upgrade) {
                    task.on_tx(self.id, n).await;
                }
                Ok(())
            }
            Err(e) => {
                let _ = wait_all;
                Err(Self::classify_io_error(e))
            }
        }
    }

    /// Reads up to `max_len` bytes. If `wait_all`, loops until exactly `max_len`
    /// bytes have been read (or the peer closes); otherwise returns as soon as any
    /// data arrives.
    pub async fn receive(&mut self, max_len: usize, wait_all: bool) -> Result<Bytes, TransportError> {
        let socket = self.socket.as_mut().ok_or(TransportError::NotConnected)?;
        let mut buf = BytesMut::with_capacity(max_len.min(64 * 1024));
        loop {
            let before = buf.len();
            let n = socket
                .read_buf(&mut buf)
                .await
                .map_err(Self::classify_io_error)?;
            if n == 0 {
                if buf.is_empty() {
                    return Err(TransportError::ConnectionLost);
                }
                break;
            }
            self.touch();
            if !wait_all || buf.len() - before == 0 {
                break;
            }
            if buf.len() >= max_len {
                break;
            }
        }
        let bytes = buf.freeze();
        if let Some(task) = self.task.as_ref().and_then(Weak::upgrade) {
            task.on_rx(self.id, bytes.clone()).await;
        }
        Ok(bytes)
    }

    fn classify_io_error(err: std::io::Error) -> TransportError {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset => TransportError::ConnectionReset,
            ErrorKind::ConnectionAborted => TransportError::ConnectionAborted,
            ErrorKind::NotConnected | ErrorKind::BrokenPipe => TransportError::ConnectionLost,
            ErrorKind::WouldBlock => TransportError::WouldBlock,
            _ => TransportError::Io(err),
        }
    }

    /// Closes the socket and notifies the bound task (§4.1 "disconnect()").
    #[instrument(skip(self), fields(connection_id = self.id))]
    pub async fn disconnect(&mut self) {
        self.state = ConnectionState::Closing;
        if let Some(Socket::Plain(mut s)) = self.socket.take() {
            let _ = s.shutdown().await;
        } else if let Some(Socket::Tls(mut s)) = self.socket.take() {
            let _ = s.shutdown().await;
        }
        self.state = ConnectionState::Closed;
        if let Some(task) = self.task.as_ref().and_then(Weak::upgrade) {
            task.on_disconnected(self.id, None).await;
        }
        warn!(connection_id = self.id, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_starts_closed() {
        let c = Connection::new(1, "example.com", 80, "example.com", 80, Duration::from_secs(30));
        assert_eq!(c.state(), ConnectionState::Closed);
        assert!(!c.is_idle());
    }

    #[test]
    fn timeout_respects_parked_idle_flag() {
        let mut c = Connection::new(1, "h", 80, "h", 80, Duration::from_millis(1));
        c.state = ConnectionState::ConnectedPlain;
        c.last_activity = Instant::now() - Duration::from_secs(1);
        assert!(c.is_timed_out(Instant::now()));
        c.park_idle(true);
        assert!(!c.is_timed_out(Instant::now()));
    }

    #[test]
    fn closed_connection_is_never_timed_out() {
        let c = Connection::new(1, "h", 80, "h", 80, Duration::from_millis(1));
        assert!(!c.is_timed_out(Instant::now() + Duration::from_secs(10)));
    }
}
