//! SOCKSv4/v5 proxy traversal at the transport layer (§4.1, §6 "Proxy").
//!
//! SOCKSv5 is attempted first; per the spec's resolution of the source's ambiguous
//! fallback criterion (§9 Open Questions), we downgrade to SOCKSv4 only when the
//! SOCKSv5 method-selection reply's first byte is `0x00` (a SOCKSv4 reply would
//! never begin with the SOCKSv5 version byte `0x05`, so a bare `0x00` is the
//! conservative, unambiguous signal that the peer is actually a SOCKSv4-only proxy
//! replying to what it parsed as a SOCKSv4 request).

use std::net::Ipv4Addr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::SocksError;

/// A resolved SOCKS proxy endpoint plus optional username/password credentials
/// (§6 "Proxy credentials are supplied by configuration").
#[derive(Debug, Clone)]
pub struct ProxyKind {
    pub version: SocksVersion,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Which SOCKS protocol version to attempt first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    /// Try SOCKSv5 first, falling back to SOCKSv4 per the rule above.
    V5PreferV4Fallback,
    /// Speak SOCKSv4 only.
    V4Only,
}

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS4_VERSION: u8 = 0x04;
const SOCKS4_CONNECT: u8 = 0x01;
const SOCKS5_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_V4: u8 = 0x01;

/// Negotiates the configured SOCKS handshake over an already-connected TCP stream
/// to the proxy, then asks it to `CONNECT` to `target_host:target_port`. On
/// success, the stream is ready to carry the origin protocol (e.g. HTTP or TLS).
pub async fn negotiate(
    mut stream: TcpStream,
    proxy: ProxyKind,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream, SocksError> {
    match proxy.version {
        SocksVersion::V4Only => {
            socks4_connect(&mut stream, target_host, target_port).await?;
            Ok(stream)
        }
        SocksVersion::V5PreferV4Fallback => {
            match socks5_connect(&mut stream, &proxy, target_host, target_port).await {
                Ok(()) => Ok(stream),
                Err(Socks5Outcome::FallbackToV4) => {
                    socks4_connect(&mut stream, target_host, target_port).await?;
                    Ok(stream)
                }
                Err(Socks5Outcome::Error(e)) => Err(e),
            }
        }
    }
}

enum Socks5Outcome {
    FallbackToV4,
    Error(SocksError),
}

impl From<SocksError> for Socks5Outcome {
    fn from(e: SocksError) -> Self {
        Socks5Outcome::Error(e)
    }
}

async fn socks5_connect(
    stream: &mut TcpStream,
    proxy: &ProxyKind,
    target_host: &str,
    target_port: u16,
) -> Result<(), Socks5Outcome> {
    let use_userpass = proxy.user.is_some();
    let methods: &[u8] = if use_userpass { &[0x00, 0x02] } else { &[0x00] };
    let mut hello = vec![SOCKS5_VERSION, methods.len() as u8];
    hello.extend_from_slice(methods);
    stream
        .write_all(&hello)
        .await
        .map_err(|e| Socks5Outcome::Error(io_to_socks(e)))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| Socks5Outcome::Error(io_to_socks(e)))?;

    if reply[0] == 0x00 {
        // See module docs: the conservative downgrade signal.
        return Err(Socks5Outcome::FallbackToV4);
    }
    if reply[0] != SOCKS5_VERSION {
        return Err(Socks5Outcome::Error(SocksError::WrongVersion));
    }
    match reply[1] {
        0x00 => {}
        0x02 if use_userpass => {
            socks5_userpass_auth(stream, proxy).await?;
        }
        0xFF => return Err(Socks5Outcome::Error(SocksError::NotAllowedByRuleset)),
        _ => return Err(Socks5Outcome::Error(SocksError::General)),
    }

    let mut req = vec![SOCKS5_VERSION, SOCKS5_CONNECT, 0x00];
    if let Ok(v4) = target_host.parse::<Ipv4Addr>() {
        req.push(SOCKS5_ATYP_V4);
        req.extend_from_slice(&v4.octets());
    } else {
        req.push(SOCKS5_ATYP_DOMAIN);
        req.push(target_host.len() as u8);
        req.extend_from_slice(target_host.as_bytes());
    }
    req.extend_from_slice(&target_port.to_be_bytes());
    stream
        .write_all(&req)
        .await
        .map_err(|e| Socks5Outcome::Error(io_to_socks(e)))?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| Socks5Outcome::Error(io_to_socks(e)))?;
    if head[0] != SOCKS5_VERSION {
        return Err(Socks5Outcome::Error(SocksError::WrongVersion));
    }
    if head[1] != 0x00 {
        return Err(Socks5Outcome::Error(socks5_reply_error(head[1])));
    }
    skip_socks5_bound_address(stream, head[3])
        .await
        .map_err(|e| Socks5Outcome::Error(io_to_socks(e)))?;
    Ok(())
}

async fn socks5_userpass_auth(
    stream: &mut TcpStream,
    proxy: &ProxyKind,
) -> Result<(), Socks5Outcome> {
    let user = proxy.user.as_deref().unwrap_or_default();
    let pass = proxy.password.as_deref().unwrap_or_default();
    let mut req = vec![0x01, user.len() as u8];
    req.extend_from_slice(user.as_bytes());
    req.push(pass.len() as u8);
    req.extend_from_slice(pass.as_bytes());
    stream
        .write_all(&req)
        .await
        .map_err(|e| Socks5Outcome::Error(io_to_socks(e)))?;
    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| Socks5Outcome::Error(io_to_socks(e)))?;
    if reply[1] != 0x00 {
        return Err(Socks5Outcome::Error(SocksError::AuthFailed));
    }
    Ok(())
}

async fn skip_socks5_bound_address(stream: &mut TcpStream, atyp: u8) -> std::io::Result<()> {
    match atyp {
        SOCKS5_ATYP_V4 => {
            let mut rest = [0u8; 4 + 2];
            stream.read_exact(&mut rest).await?;
        }
        0x04 => {
            let mut rest = [0u8; 16 + 2];
            stream.read_exact(&mut rest).await?;
        }
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await?;
        }
        _ => {}
    }
    Ok(())
}

fn socks5_reply_error(code: u8) -> SocksError {
    match code {
        0x02 => SocksError::NotAllowedByRuleset,
        0x03 => SocksError::NetworkUnreachable,
        0x04 => SocksError::HostUnreachable,
        0x05 => SocksError::ConnectionRefused,
        0x06 => SocksError::TtlExpired,
        0x07 => SocksError::CommandUnsupported,
        0x08 => SocksError::AddressTypeUnsupported,
        _ => SocksError::General,
    }
}

async fn socks4_connect(
    stream: &mut TcpStream,
    target_host: &str,
    target_port: u16,
) -> Result<(), SocksError> {
    let addr = target_host
        .parse::<Ipv4Addr>()
        .unwrap_or(Ipv4Addr::new(0, 0, 0, 1));
    let mut req = vec![SOCKS4_VERSION, SOCKS4_CONNECT];
    req.extend_from_slice(&target_port.to_be_bytes());
    req.extend_from_slice(&addr.octets());
    req.push(0x00); // empty userid

    // SOCKS4A: if the host didn't parse as an IPv4 literal, append the hostname
    // after the null-terminated userid instead of resolving locally.
    if target_host.parse::<Ipv4Addr>().is_err() {
        req.extend_from_slice(target_host.as_bytes());
        req.push(0x00);
    }
    stream.write_all(&req).await.map_err(io_to_socks)?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.map_err(io_to_socks)?;
    if reply[0] != 0x00 {
        return Err(SocksError::WrongVersion);
    }
    match reply[1] {
        0x5A => Ok(()),
        0x5B => Err(SocksError::NotAllowedByRuleset),
        0x5C | 0x5D => Err(SocksError::General),
        _ => Err(SocksError::General),
    }
}

fn io_to_socks(_err: std::io::Error) -> SocksError {
    SocksError::General
}
