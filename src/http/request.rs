//! `Request` — one logical HTTP call (§3 "Request").

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::connection::socks::ProxyKind;
use crate::error::AxedaError;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Head,
    Connect,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Head => "HEAD",
            Method::Connect => "CONNECT",
        }
    }
}

/// HTTP protocol version requested (§3 "version").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

/// Callback surface a [`Request`] producer implements to observe the transaction
/// lifecycle (§3 "four callbacks").
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Status line observed; return `false` to abandon the body.
    async fn on_response(&self, status: u16) -> bool {
        let _ = status;
        true
    }
    /// One chunk of the response entity; return `false` to cancel the remainder.
    async fn on_entity(&self, offset: u64, chunk: Bytes) -> bool {
        let _ = (offset, chunk);
        true
    }
    /// The transaction completed (successfully or with a non-2xx status, which is
    /// still delivered here — only transport/protocol failures go to `on_error`).
    async fn on_completed(&self, status: u16, headers: Vec<(String, String)>) {
        let _ = (status, headers);
    }
    /// A transport- or protocol-level failure ended the transaction.
    async fn on_error(&self, error: AxedaError) {
        let _ = error;
    }
}

/// One logical HTTP call (§3 "Request").
#[derive(Debug, Clone)]
pub struct Request {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub method: Method,
    pub version: HttpVersion,
    pub tls: bool,
    pub persistent: bool,
    /// Forbid upgrading a non-persistent request to HTTP/1.1 keep-alive (§3 "strict flag").
    pub strict: bool,
    pub timeout: Duration,
    pub proxy_override: Option<ProxyKind>,
    /// Ordered request headers (§3 "request headers (ordered map)").
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub content_type: Option<String>,
    /// Credentials to present if the origin server challenges with Basic/Digest/NTLM.
    pub credentials: Option<(String, String)>,
}

impl Request {
    /// Builds a minimal `GET` request against `host:port/path`.
    #[must_use]
    pub fn get(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            method: Method::Get,
            version: HttpVersion::Http11,
            tls: false,
            persistent: true,
            strict: false,
            timeout: Duration::from_secs(30),
            proxy_override: None,
            headers: Vec::new(),
            body: None,
            content_type: None,
            credentials: None,
        }
    }

    /// Builds a `POST` request carrying `body` (used for EMessage delivery, §6).
    #[must_use]
    pub fn post(
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
        body: Bytes,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            method: Method::Post,
            body: Some(body),
            content_type: Some(content_type.into()),
            ..Self::get(host, port, path)
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }
}
