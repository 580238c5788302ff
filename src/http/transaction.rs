//! C3: `HttpTransaction` — per-request state machine (§4.3).
//!
//! Formats the request head, parses the response head, and handles 100-Continue,
//! 401/407 auth retries, CONNECT tunneling, and chunked decoding. The asynchronous-
//! close recovery described in §4.3 is the caller's ([`crate::user_agent::UserAgent`]'s)
//! responsibility, since it spans transaction instances (a fresh connection is
//! substituted and the transaction re-run).

use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};

use crate::connection::Connection;
use crate::error::{AxedaError, HttpError, TransportError};
use crate::http::auth::{
    self, AuthCache, AuthScheme, NtlmConnectionState,
};
use crate::http::chunked::ChunkedDecoder;
use crate::http::request::{HttpVersion, Method, Request, RequestHandler};

/// Proxy credentials used when the transaction must authenticate to an
/// intermediate HTTP proxy rather than (or in addition to) the origin server.
#[derive(Debug, Clone, Default)]
pub struct ProxyAuthConfig {
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Outcome of one fully-drained response head (§4.3 "Response parsing").
struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parses a raw response head buffer (everything up to, but not including, the
/// trailing blank line) into status + ordered headers (§4.3 "Response parsing").
fn parse_response_head(raw: &str) -> Result<ResponseHead, HttpError> {
    let mut lines = raw.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| HttpError::BadResponse("empty response".to_string()))?;
    let mut parts = status_line.splitn(3, ' ');
    let _proto = parts
        .next()
        .ok_or_else(|| HttpError::BadResponse("missing protocol".to_string()))?;
    let status: u16 = parts
        .next()
        .ok_or_else(|| HttpError::BadResponse("missing status code".to_string()))?
        .parse()
        .map_err(|_| HttpError::BadResponse("non-numeric status code".to_string()))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::BadResponse(format!("header without colon: {line:?}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(ResponseHead { status, headers })
}

/// Whether the connection should be kept alive after this response, per §4.3
/// "Persistent decision".
fn is_persistent(version: HttpVersion, head: &ResponseHead) -> bool {
    match head.header("Connection").map(str::to_ascii_lowercase) {
        Some(v) if v == "keep-alive" => true,
        Some(v) if v == "close" => false,
        _ => matches!(version, HttpVersion::Http11),
    }
}

/// Formats the request head exactly as §4.3 "Head formatting rules" specifies.
#[must_use]
pub fn format_request_head(
    req: &Request,
    via_http_proxy: bool,
    is_connect_tunnel: bool,
    ntlm_round_in_flight: bool,
    suppress_body: bool,
) -> String {
    let method = if is_connect_tunnel {
        Method::Connect.as_str()
    } else {
        req.method.as_str()
    };
    let target = if is_connect_tunnel {
        format!("{}:{}", req.host, req.port)
    } else if via_http_proxy && !req.tls {
        format!(
            "http://{}:{}{}",
            req.host,
            req.port,
            req.path
        )
    } else {
        req.path.clone()
    };

    let mut head = format!("{method} {target} {}\r\n", req.version.as_str());
    if matches!(req.version, HttpVersion::Http11) && !is_connect_tunnel {
        head.push_str(&format!("Host: {}:{}\r\n", req.host, req.port));
    }

    let content_length = if suppress_body {
        0
    } else {
        req.body.as_ref().map_or(0, Bytes::len)
    };
    if !is_connect_tunnel {
        head.push_str(&format!("Content-Length: {content_length}\r\n"));
        if let Some(ct) = &req.content_type {
            head.push_str(&format!("Content-Type: {ct}\r\n"));
        }
    }

    let close_this_connection = matches!(req.version, HttpVersion::Http10) || !req.persistent;
    if ntlm_round_in_flight {
        head.push_str("Proxy-Connection: Keep-Alive\r\n");
    } else if close_this_connection {
        head.push_str("Connection: close\r\n");
    }

    for (name, value) in &req.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    head
}

/// Reads off `connection` until a full response head (terminated by a blank
/// line) has arrived, returning the parsed head and any body bytes that were
/// read as part of the same network read past the blank line.
async fn read_response_head(
    connection: &mut Connection,
) -> Result<(ResponseHead, BytesMut), AxedaError> {
    let mut buf = BytesMut::new();
    loop {
        if let Some(pos) = find_double_crlf(&buf) {
            let head_bytes = buf.split_to(pos);
            buf.advance_past_double_crlf();
            let head_str = String::from_utf8_lossy(&head_bytes).into_owned();
            let head = parse_response_head(&head_str).map_err(HttpError::from)?;
            return Ok((head, buf));
        }
        let chunk = connection.receive(8192, false).await?;
        if chunk.is_empty() {
            return Err(HttpError::BadResponse("connection closed before response head".to_string()).into());
        }
        buf.extend_from_slice(&chunk);
        if buf.len() > 64 * 1024 {
            return Err(HttpError::BadResponse("response head too large".to_string()).into());
        }
    }
}

trait AdvancePastDoubleCrlf {
    fn advance_past_double_crlf(&mut self);
}
impl AdvancePastDoubleCrlf for BytesMut {
    fn advance_past_double_crlf(&mut self) {
        if self.starts_with(b"\r\n") {
            let _ = self.split_to(2);
        }
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Drains and delivers the response entity body according to §4.3 "Body decoding",
/// honoring the caller's `on_entity` cancellation signal (§4.3 "Entity delivery").
async fn deliver_body(
    head: &ResponseHead,
    mut already_read: BytesMut,
    connection: &mut Connection,
    handler: &dyn RequestHandler,
    skip_body: bool,
) -> Result<(), AxedaError> {
    let chunked = head
        .header("Transfer-Encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
    let content_length: Option<u64> = head.header("Content-Length").and_then(|v| v.parse().ok());

    let mut offset: u64 = 0;
    if chunked {
        let mut decoder = ChunkedDecoder::new();
        let mut scratch = Vec::new();
        decoder.feed(&already_read, &mut scratch)?;
        if !scratch.is_empty() && !skip_body {
            let cont = handler.on_entity(offset, Bytes::from(scratch.clone())).await;
            offset += scratch.len() as u64;
            if !cont {
                connection.disconnect().await;
                return Ok(());
            }
        }
        while !decoder.is_done() {
            let chunk = connection.receive(8192, false).await?;
            let mut scratch = Vec::new();
            decoder.feed(&chunk, &mut scratch)?;
            if !scratch.is_empty() && !skip_body {
                let cont = handler.on_entity(offset, Bytes::from(scratch.clone())).await;
                offset += scratch.len() as u64;
                if !cont {
                    connection.disconnect().await;
                    return Ok(());
                }
            }
        }
        return Ok(());
    }

    if let Some(len) = content_length {
        if already_read.len() as u64 >= len {
            already_read.truncate(len as usize);
        }
        if !already_read.is_empty() && !skip_body {
            let cont = handler.on_entity(offset, already_read.clone().freeze()).await;
            offset += already_read.len() as u64;
            if !cont {
                connection.disconnect().await;
                return Ok(());
            }
        }
        while offset < len {
            let remaining = (len - offset) as usize;
            let chunk = connection.receive(remaining.min(8192), false).await?;
            if chunk.is_empty() {
                return Err(
                    HttpError::BadResponse("connection closed mid-entity".to_string()).into(),
                );
            }
            if !skip_body {
                let cont = handler.on_entity(offset, chunk.clone()).await;
                if !cont {
                    connection.disconnect().await;
                    return Ok(());
                }
            }
            offset += chunk.len() as u64;
        }
        return Ok(());
    }

    // No Content-Length, not chunked: read until close (§4.3 "Otherwise, read until close.").
    if !already_read.is_empty() && !skip_body {
        handler.on_entity(offset, already_read.clone().freeze()).await;
        offset += already_read.len() as u64;
    }
    loop {
        match connection.receive(8192, false).await {
            Ok(chunk) if !chunk.is_empty() => {
                if !skip_body {
                    let cont = handler.on_entity(offset, chunk.clone()).await;
                    if !cont {
                        break;
                    }
                }
                offset += chunk.len() as u64;
            }
            _ => break,
        }
    }
    Ok(())
}

/// Sends the CONNECT line for `req.host:req.port` over an already-open, still
/// plaintext `connection` to an HTTP proxy, and waits for the `200` response
/// that means the tunnel is up (§4.3 "CONNECT tunneling", §6 "Proxy").
///
/// On any other status the tunnel was refused; the caller should treat this
/// like any other failed connection attempt.
async fn establish_connect_tunnel(
    req: &Request,
    handler: &dyn RequestHandler,
    connection: &mut Connection,
) -> Result<(), AxedaError> {
    let head = format_request_head(req, true, true, false, true);
    connection
        .send(Bytes::from(head.into_bytes()), true)
        .await?;
    let (head, leftover) = read_response_head(connection).await?;
    if head.status != 200 {
        deliver_body(&head, leftover, connection, handler, true).await?;
        return Err(HttpError::BadResponse(format!(
            "CONNECT tunnel refused: {}",
            head.status
        ))
        .into());
    }
    // A compliant proxy sends no body with a 200 CONNECT response, but a
    // stray byte here would otherwise be silently dropped.
    if !leftover.is_empty() {
        warn!("discarding unexpected bytes after CONNECT 200 response head");
    }
    Ok(())
}

/// Runs one [`Request`] to completion over `connection`, including auth retries,
/// CONNECT tunneling, and chunked/length/close body decoding (§4.3).
///
/// When `via_http_proxy` is set and `req.tls` is true, a CONNECT tunnel is
/// established first (§4.3 "200 — if this was a CONNECT for TLS tunneling,
/// enable TLS on the connection, clear NTLM state, re-initiate with the real
/// request"): `tls_connector` upgrades the now-tunneled plaintext connection
/// to TLS before the real request is sent, exactly as if it had connected
/// directly to the origin.
///
/// Returns `Ok(true)` if the connection should be kept open for reuse, `Ok(false)`
/// if it was (or should be) closed.
#[instrument(skip(req, handler, connection, auth_cache, proxy_auth, tls_connector), fields(host = %req.host, path = %req.path))]
pub async fn run_transaction(
    req: &Request,
    handler: &dyn RequestHandler,
    connection: &mut Connection,
    auth_cache: &AuthCache,
    via_http_proxy: bool,
    proxy_auth: Option<&ProxyAuthConfig>,
    tls_connector: Option<&TlsConnector>,
) -> Result<bool, AxedaError> {
    let mut attempted_auth = false;
    let mut ntlm_state: Option<NtlmConnectionState> = None;
    let mut skip_body_once = false;

    if via_http_proxy && req.tls && matches!(connection.state(), crate::connection::ConnectionState::ConnectedPlain) {
        establish_connect_tunnel(req, handler, connection).await?;
        let connector = tls_connector.ok_or_else(|| {
            AxedaError::from(HttpError::BadResponse(
                "CONNECT tunnel established but no TLS connector configured".to_string(),
            ))
        })?;
        let server_name = ServerName::try_from(req.host.clone())
            .map_err(|_| TransportError::BadUrl(req.host.clone()))?;
        connection.enable_tls(connector, server_name).await?;
        // Re-initiate with the real request below; NTLM state starts fresh
        // (it was never populated since the loop hasn't run yet).
    }
    let via_http_proxy = via_http_proxy && !matches!(connection.state(), crate::connection::ConnectionState::ConnectedTls);

    loop {
        let ntlm_round_in_flight = ntlm_state.as_ref().is_some_and(|s| !s.is_round_two());
        let suppress_body = ntlm_round_in_flight;

        let mut head_text = format_request_head(
            req,
            via_http_proxy,
            false,
            ntlm_round_in_flight,
            suppress_body,
        );

        if let Some(state) = &ntlm_state {
            let header = if state.is_round_two() {
                format!(
                    "Proxy-Authorization: NTLM {}\r\n",
                    auth::ntlm_type3_message(
                        state,
                        "",
                        proxy_auth.and_then(|p| p.user.as_deref()).unwrap_or(""),
                        proxy_auth.and_then(|p| p.password.as_deref()).unwrap_or(""),
                        "",
                    )
                )
            } else {
                format!("Proxy-Authorization: NTLM {}\r\n", auth::ntlm_type1_message())
            };
            head_text = splice_header_before_blank_line(&head_text, &header);
        } else if let Some(scheme) = auth_cache.lookup(&req.host, req.port, &req.path) {
            let header = render_auth_header(&scheme, req, proxy_auth);
            if let Some(header) = header {
                head_text = splice_header_before_blank_line(&head_text, &header);
            }
        }

        connection
            .send(Bytes::from(head_text.into_bytes()), true)
            .await?;
        if !suppress_body {
            if let Some(body) = &req.body {
                connection.send(body.clone(), true).await?;
            }
        }

        let (head, leftover) = read_response_head(connection).await?;
        debug!(status = head.status, "response head received");

        if head.status == 100 {
            continue;
        }

        if (head.status == 401 || head.status == 407) && !attempted_auth {
            let header_name = if head.status == 407 {
                "Proxy-Authenticate"
            } else {
                "WWW-Authenticate"
            };
            let Some(challenge) = head.header(header_name) else {
                deliver_body(&head, leftover, connection, handler, false).await?;
                handler.on_completed(head.status, head.headers.clone()).await;
                return Ok(is_persistent(req.version, &head));
            };
            if challenge.to_ascii_lowercase().starts_with("ntlm") {
                if let Some(state) = ntlm_state.as_ref().filter(|s| !s.is_round_two()) {
                    let _ = state;
                    // Round 1 -> 2: parse the Type-2 challenge out of the header value.
                    let b64 = challenge.splitn(2, ' ').nth(1).unwrap_or("");
                    skip_body_once = true;
                    let parsed = auth::parse_ntlm_type2(b64)?;
                    ntlm_state = Some(parsed);
                    deliver_body(&head, leftover, connection, handler, skip_body_once).await?;
                    continue;
                }
                ntlm_state = Some(NtlmConnectionState::default());
                deliver_body(&head, leftover, connection, handler, true).await?;
                continue;
            }
            let scheme = AuthScheme::parse(challenge).map_err(AxedaError::from)?;
            auth_cache.insert(&req.host, req.port, &req.path, scheme);
            attempted_auth = true;
            deliver_body(&head, leftover, connection, handler, true).await?;
            continue;
        }
        if (head.status == 401 || head.status == 407) && attempted_auth {
            deliver_body(&head, leftover, connection, handler, true).await?;
            handler
                .on_error(AxedaError::from(HttpError::AuthFailed))
                .await;
            return Ok(false);
        }

        let cont = handler.on_response(head.status).await;
        if !cont {
            connection.disconnect().await;
            return Ok(false);
        }
        deliver_body(&head, leftover, connection, handler, false).await?;
        handler.on_completed(head.status, head.headers.clone()).await;
        let persistent = is_persistent(req.version, &head);
        if !persistent || (req.strict && !req.persistent) {
            connection.disconnect().await;
            return Ok(false);
        }
        return Ok(true);
    }
}

fn render_auth_header(
    scheme: &AuthScheme,
    req: &Request,
    _proxy_auth: Option<&ProxyAuthConfig>,
) -> Option<String> {
    let (user, password) = req.credentials.as_ref()?;
    match scheme {
        AuthScheme::Basic { .. } => Some(format!(
            "Authorization: {}\r\n",
            auth::basic_credential(user, password)
        )),
        AuthScheme::Digest { realm, nonce, opaque } => Some(format!(
            "Authorization: {}\r\n",
            auth::digest_credential(
                realm,
                nonce,
                opaque.as_deref(),
                user,
                password,
                req.method.as_str(),
                &req.path
            )
        )),
        AuthScheme::Ntlm => None,
    }
}

fn splice_header_before_blank_line(head: &str, extra: &str) -> String {
    let mut out = head.to_string();
    if let Some(pos) = out.rfind("\r\n\r\n") {
        out.insert_str(pos + 2, extra);
    } else {
        out.push_str(extra);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Request;

    #[test]
    fn formats_simple_get_head() {
        let req = Request::get("example.com", 80, "/x");
        let head = format_request_head(&req, false, false, false, false);
        assert!(head.starts_with("GET /x HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.com:80\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn proxy_absolute_uri_for_plain_target() {
        let req = Request::get("example.com", 80, "/x");
        let head = format_request_head(&req, true, false, false, false);
        assert!(head.starts_with("GET http://example.com:80/x HTTP/1.1\r\n"));
    }

    #[test]
    fn connect_tunnel_uses_host_port_target() {
        let mut req = Request::get("example.com", 443, "/x").with_tls(true);
        req.method = Method::Connect;
        let head = format_request_head(&req, true, true, false, false);
        assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(!head.contains("Host:"));
    }

    #[test]
    fn http10_or_non_persistent_adds_connection_close() {
        let mut req = Request::get("h", 80, "/");
        req.version = HttpVersion::Http10;
        let head = format_request_head(&req, false, false, false, false);
        assert!(head.contains("Connection: close\r\n"));
    }

    #[test]
    fn ntlm_round_in_flight_uses_proxy_connection_keep_alive() {
        let req = Request::get("h", 80, "/");
        let head = format_request_head(&req, false, false, true, true);
        assert!(head.contains("Proxy-Connection: Keep-Alive\r\n"));
        assert!(!head.contains("Connection: close"));
    }

    #[test]
    fn parses_status_and_headers() {
        let raw = "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-A: b\r\n";
        let head = parse_response_head(raw).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.header("content-length"), Some("5"));
        assert_eq!(head.header("X-A"), Some("b"));
    }

    #[test]
    fn header_without_colon_is_a_parse_error() {
        let raw = "HTTP/1.1 200 OK\r\nbroken-header\r\n";
        assert!(parse_response_head(raw).is_err());
    }

    #[test]
    fn persistence_defaults_by_version() {
        let raw_11 = "HTTP/1.1 200 OK\r\n";
        let head_11 = parse_response_head(raw_11).unwrap();
        assert!(is_persistent(HttpVersion::Http11, &head_11));

        let raw_10 = "HTTP/1.0 200 OK\r\n";
        let head_10 = parse_response_head(raw_10).unwrap();
        assert!(!is_persistent(HttpVersion::Http10, &head_10));
    }

    #[test]
    fn connection_header_overrides_version_default() {
        let raw = "HTTP/1.0 200 OK\r\nConnection: Keep-Alive\r\n";
        let head = parse_response_head(raw).unwrap();
        assert!(is_persistent(HttpVersion::Http10, &head));
    }
}
