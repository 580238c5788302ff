//! C4: `AuthEngine` — parses `WWW-Authenticate`/`Proxy-Authenticate` challenges and
//! produces matching `Authorization`/`Proxy-Authorization` headers for
//! Basic/Digest/NTLM (§4.4).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use md5::{Digest, Md5};

use crate::error::HttpError;
use crate::http::des::des_encrypt_block;

/// Which scheme a cached or parsed challenge uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    Basic {
        realm: String,
    },
    Digest {
        realm: String,
        nonce: String,
        opaque: Option<String>,
    },
    Ntlm,
}

impl AuthScheme {
    /// Parses the scheme token plus challenge parameters out of a
    /// `WWW-Authenticate`/`Proxy-Authenticate` header value.
    ///
    /// # Errors
    /// Returns [`HttpError::AuthUnsupported`] for any scheme other than
    /// Basic/Digest/NTLM (§6 "Authentication").
    pub fn parse(header_value: &str) -> Result<Self, HttpError> {
        let trimmed = header_value.trim();
        let (scheme, rest) = trimmed
            .split_once(char::is_whitespace)
            .unwrap_or((trimmed, ""));
        match scheme.to_ascii_lowercase().as_str() {
            "basic" => Ok(AuthScheme::Basic {
                realm: parse_param(rest, "realm").unwrap_or_default(),
            }),
            "digest" => Ok(AuthScheme::Digest {
                realm: parse_param(rest, "realm").unwrap_or_default(),
                nonce: parse_param(rest, "nonce").unwrap_or_default(),
                opaque: parse_param(rest, "opaque"),
            }),
            "ntlm" => Ok(AuthScheme::Ntlm),
            other => Err(HttpError::AuthUnsupported(other.to_string())),
        }
    }
}

fn parse_param(rest: &str, name: &str) -> Option<String> {
    for part in rest.split(',') {
        let part = part.trim();
        if let Some((k, v)) = part.split_once('=') {
            if k.trim().eq_ignore_ascii_case(name) {
                return Some(v.trim().trim_matches('"').to_string());
            }
        }
    }
    None
}

/// Per-connection NTLM handshake state (§3 "NTLM parameters (nonce, flags,
/// target name)"; §4.4 "NTLM is never cached beyond the connection").
#[derive(Debug, Clone, Default)]
pub struct NtlmConnectionState {
    /// `None` until the Type-2 challenge has been received.
    pub server_challenge: Option<[u8; 8]>,
    pub target_name: Option<String>,
    pub flags: u32,
}

impl NtlmConnectionState {
    #[must_use]
    pub fn is_round_two(&self) -> bool {
        self.server_challenge.is_some()
    }
}

const NTLM_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
const NTLM_NEGOTIATE_FLAGS: u32 = 0x0000_0001 // Negotiate Unicode
    | 0x0000_0002 // Negotiate OEM
    | 0x0000_0004 // Request Target
    | 0x0000_0200 // NTLM
    | 0x0000_1000 // Negotiate Domain Supplied
    | 0x0000_2000; // Negotiate Workstation Supplied

/// Builds the base64-encoded Type-1 NTLM negotiate message (§4.4 "Round 1").
#[must_use]
pub fn ntlm_type1_message() -> String {
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(NTLM_SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes());
    msg.extend_from_slice(&NTLM_NEGOTIATE_FLAGS.to_le_bytes());
    // Empty domain/workstation security buffers (len=0, maxlen=0, offset=32).
    msg.extend_from_slice(&0u16.to_le_bytes());
    msg.extend_from_slice(&0u16.to_le_bytes());
    msg.extend_from_slice(&32u32.to_le_bytes());
    msg.extend_from_slice(&0u16.to_le_bytes());
    msg.extend_from_slice(&0u16.to_le_bytes());
    msg.extend_from_slice(&32u32.to_le_bytes());
    BASE64.encode(msg)
}

/// Parses the base64-encoded Type-2 NTLM challenge message (§4.4 "On response,
/// parse the Type-2 challenge").
///
/// # Errors
/// Returns [`HttpError::BadResponse`] if the message is malformed.
pub fn parse_ntlm_type2(base64_message: &str) -> Result<NtlmConnectionState, HttpError> {
    let raw = BASE64
        .decode(base64_message.trim())
        .map_err(|e| HttpError::BadResponse(format!("bad NTLM base64: {e}")))?;
    if raw.len() < 32 || &raw[0..8] != NTLM_SIGNATURE.as_slice() {
        return Err(HttpError::BadResponse("bad NTLM Type-2 signature".to_string()));
    }
    let msg_type = u32::from_le_bytes(raw[8..12].try_into().unwrap());
    if msg_type != 2 {
        return Err(HttpError::BadResponse(format!(
            "expected NTLM Type-2, got {msg_type}"
        )));
    }
    let target_len = u16::from_le_bytes(raw[12..14].try_into().unwrap()) as usize;
    let target_offset = u32::from_le_bytes(raw[16..20].try_into().unwrap()) as usize;
    let flags = u32::from_le_bytes(raw[20..24].try_into().unwrap());
    let mut challenge = [0u8; 8];
    if raw.len() < 32 {
        return Err(HttpError::BadResponse("truncated NTLM Type-2".to_string()));
    }
    challenge.copy_from_slice(&raw[24..32]);
    let target_name = raw
        .get(target_offset..target_offset + target_len)
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
    Ok(NtlmConnectionState {
        server_challenge: Some(challenge),
        target_name,
        flags,
    })
}

/// Computes the classic NTLMv1 LM and NT responses and assembles the
/// base64-encoded Type-3 authenticate message (§4.4 "Round 2").
#[must_use]
pub fn ntlm_type3_message(
    state: &NtlmConnectionState,
    domain: &str,
    user: &str,
    password: &str,
    workstation: &str,
) -> String {
    let challenge = state.server_challenge.unwrap_or([0u8; 8]);
    let lm_response = ntlm_lm_response(password, &challenge);
    let nt_response = ntlm_nt_response(password, &challenge);

    let domain_u = utf16le(domain);
    let user_u = utf16le(user);
    let workstation_u = utf16le(workstation);

    let base_offset = 64u32;
    let mut offset = base_offset;
    let lm_offset = offset;
    offset += lm_response.len() as u32;
    let nt_offset = offset;
    offset += nt_response.len() as u32;
    let domain_offset = offset;
    offset += domain_u.len() as u32;
    let user_offset = offset;
    offset += user_u.len() as u32;
    let workstation_offset = offset;

    let mut msg = Vec::with_capacity(offset as usize + workstation_u.len());
    msg.extend_from_slice(NTLM_SIGNATURE);
    msg.extend_from_slice(&3u32.to_le_bytes());
    push_security_buffer(&mut msg, lm_response.len() as u16, lm_offset);
    push_security_buffer(&mut msg, nt_response.len() as u16, nt_offset);
    push_security_buffer(&mut msg, domain_u.len() as u16, domain_offset);
    push_security_buffer(&mut msg, user_u.len() as u16, user_offset);
    push_security_buffer(&mut msg, workstation_u.len() as u16, workstation_offset);
    push_security_buffer(&mut msg, 0, workstation_offset + workstation_u.len() as u32); // session key
    msg.extend_from_slice(&state.flags.to_le_bytes());
    debug_assert_eq!(msg.len() as u32, base_offset);
    msg.extend_from_slice(&lm_response);
    msg.extend_from_slice(&nt_response);
    msg.extend_from_slice(&domain_u);
    msg.extend_from_slice(&user_u);
    msg.extend_from_slice(&workstation_u);
    BASE64.encode(msg)
}

fn push_security_buffer(msg: &mut Vec<u8>, len: u16, offset: u32) {
    msg.extend_from_slice(&len.to_le_bytes());
    msg.extend_from_slice(&len.to_le_bytes());
    msg.extend_from_slice(&offset.to_le_bytes());
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

fn lm_hash(password: &str) -> [u8; 16] {
    const MAGIC: &[u8; 8] = b"KGS!@#$%";
    let mut upper = password.to_uppercase();
    upper.truncate(14);
    let mut key_bytes = [0u8; 14];
    let bytes = upper.as_bytes();
    key_bytes[..bytes.len().min(14)].copy_from_slice(&bytes[..bytes.len().min(14)]);
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&des_encrypt_block(&key7_from(&key_bytes[0..7]), MAGIC));
    out[8..].copy_from_slice(&des_encrypt_block(&key7_from(&key_bytes[7..14]), MAGIC));
    out
}

fn key7_from(slice: &[u8]) -> [u8; 7] {
    let mut out = [0u8; 7];
    out[..slice.len()].copy_from_slice(slice);
    out
}

fn nt_hash(password: &str) -> [u8; 16] {
    crate::http::md4::md4(&utf16le(password))
}

fn des_response(hash16: &[u8; 16], challenge: &[u8; 8]) -> [u8; 24] {
    let mut key21 = [0u8; 21];
    key21[..16].copy_from_slice(hash16);
    let mut out = [0u8; 24];
    out[0..8].copy_from_slice(&des_encrypt_block(&key7_from(&key21[0..7]), challenge));
    out[8..16].copy_from_slice(&des_encrypt_block(&key7_from(&key21[7..14]), challenge));
    out[16..24].copy_from_slice(&des_encrypt_block(&key7_from(&key21[14..21]), challenge));
    out
}

fn ntlm_lm_response(password: &str, challenge: &[u8; 8]) -> Vec<u8> {
    des_response(&lm_hash(password), challenge).to_vec()
}

fn ntlm_nt_response(password: &str, challenge: &[u8; 8]) -> Vec<u8> {
    des_response(&nt_hash(password), challenge).to_vec()
}

/// Key identifying a cached auth challenge: (host, port, path-prefix). Proxy
/// auth is cached under `("", proxy_port_marker, "")`-shaped keys by the caller
/// (§4.4 "Proxy auth cache is keyed (proxy-host, proxy-port, \"\")").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthCacheKey {
    pub host: String,
    pub port: u16,
    pub path_prefix: String,
}

/// Process-wide, longest-path-prefix-matched cache of negotiated auth schemes
/// (§4.4, §5 "Auth caches are process-wide and mutex-protected").
#[derive(Debug, Default)]
pub struct AuthCache {
    entries: DashMap<(String, u16), Vec<(String, AuthScheme)>>,
}

impl AuthCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: &str, port: u16, path_prefix: &str, scheme: AuthScheme) {
        let mut entries = self.entries.entry((host.to_string(), port)).or_default();
        if let Some(existing) = entries.iter_mut().find(|(p, _)| p == path_prefix) {
            existing.1 = scheme;
        } else {
            entries.push((path_prefix.to_string(), scheme));
        }
    }

    /// Longest-path-prefix match against `path` (§4.4, §3 "Auth-cache entry").
    #[must_use]
    pub fn lookup(&self, host: &str, port: u16, path: &str) -> Option<AuthScheme> {
        let entries = self.entries.get(&(host.to_string(), port))?;
        entries
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, scheme)| scheme.clone())
    }
}

/// Produces an `Authorization`/`Proxy-Authorization` header value for the given
/// scheme (§4.4: per-scheme credential formatting).
#[must_use]
pub fn basic_credential(user: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{user}:{password}")))
}

/// Computes a Digest `Authorization` value (§4.4 "Digest").
#[must_use]
pub fn digest_credential(
    realm: &str,
    nonce: &str,
    opaque: Option<&str>,
    user: &str,
    password: &str,
    method: &str,
    uri: &str,
) -> String {
    let ha1 = md5_hex(format!("{user}:{realm}:{password}").as_bytes());
    let ha2 = md5_hex(format!("{method}:{uri}").as_bytes());
    let response = md5_hex(format!("{ha1}:{nonce}:{ha2}").as_bytes());
    let mut out = format!(
        "Digest username=\"{user}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\""
    );
    if let Some(opaque) = opaque {
        out.push_str(&format!(", opaque=\"{opaque}\""));
    }
    out
}

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_challenge() {
        let scheme = AuthScheme::parse("Basic realm=\"secure\"").unwrap();
        assert_eq!(scheme, AuthScheme::Basic { realm: "secure".to_string() });
    }

    #[test]
    fn parses_digest_challenge() {
        let scheme =
            AuthScheme::parse("Digest realm=\"r\", nonce=\"n\", opaque=\"o\"").unwrap();
        assert_eq!(
            scheme,
            AuthScheme::Digest {
                realm: "r".to_string(),
                nonce: "n".to_string(),
                opaque: Some("o".to_string())
            }
        );
    }

    #[test]
    fn unknown_scheme_is_unsupported() {
        let err = AuthScheme::parse("Negotiate abcd").unwrap_err();
        assert!(matches!(err, HttpError::AuthUnsupported(_)));
    }

    #[test]
    fn basic_credential_matches_known_vector() {
        assert_eq!(basic_credential("Aladdin", "open sesame"), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }

    #[test]
    fn cache_matches_longest_path_prefix() {
        let cache = AuthCache::new();
        cache.insert("h", 80, "/", AuthScheme::Basic { realm: "root".to_string() });
        cache.insert(
            "h",
            80,
            "/api/",
            AuthScheme::Digest {
                realm: "api".to_string(),
                nonce: "n".to_string(),
                opaque: None,
            },
        );
        let matched = cache.lookup("h", 80, "/api/v1/items").unwrap();
        assert!(matches!(matched, AuthScheme::Digest { .. }));
        let matched = cache.lookup("h", 80, "/static/x").unwrap();
        assert!(matches!(matched, AuthScheme::Basic { .. }));
    }

    #[test]
    fn ntlm_type1_message_round_trips_through_base64() {
        let msg = ntlm_type1_message();
        let raw = BASE64.decode(msg).unwrap();
        assert_eq!(&raw[0..8], NTLM_SIGNATURE);
        assert_eq!(u32::from_le_bytes(raw[8..12].try_into().unwrap()), 1);
    }

    #[test]
    fn ntlm_type3_message_embeds_identity_strings() {
        let mut state = NtlmConnectionState::default();
        state.server_challenge = Some([1, 2, 3, 4, 5, 6, 7, 8]);
        let msg = ntlm_type3_message(&state, "DOMAIN", "user", "pass", "WKS");
        let raw = BASE64.decode(msg).unwrap();
        assert_eq!(&raw[0..8], NTLM_SIGNATURE);
        assert_eq!(u32::from_le_bytes(raw[8..12].try_into().unwrap()), 3);
    }
}
