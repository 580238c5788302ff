//! Local desktop-application probe (§4.11 "before starting a session the
//! device probes `127.0.0.1:<probe-port>` for a cooperating desktop viewer
//! and, if found, announces it to the server").
//!
//! The probe is a tiny length-prefixed handshake: four magic bytes, then the
//! app's declared name, version, an RFB-compatibility flag, and a platform
//! string.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::domain_types::ProbePort;
use crate::error::{AxedaError, TransportError};
use std::time::Duration;

/// Magic bytes sent to identify ourselves as the agent probing for a desktop app.
const PROBE_MAGIC: [u8; 4] = [0x4C, 0x39, 0xDB, 0xAD];

/// What a cooperating desktop application reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopProbeInfo {
    pub app_name: String,
    pub version: u32,
    /// Whether the app speaks RFB (VNC) directly, letting the session skip a
    /// local protocol translation step.
    pub rfb_compatible: bool,
    pub platform: String,
}

/// Dials the local probe port and, if something answers with a well-formed
/// reply, returns what it reported. Any connection failure or malformed
/// reply is treated as "no desktop application present", not an error —
/// absence is the overwhelmingly common case on headless gateways.
#[instrument]
pub async fn probe(port: ProbePort) -> Option<DesktopProbeInfo> {
    match timeout(Duration::from_millis(500), probe_inner(port)).await {
        Ok(Ok(info)) => Some(info),
        Ok(Err(err)) => {
            debug!(error = %err, "no desktop application detected");
            None
        }
        Err(_) => {
            debug!("desktop probe timed out");
            None
        }
    }
}

async fn probe_inner(port: ProbePort) -> Result<DesktopProbeInfo, AxedaError> {
    let mut stream = TcpStream::connect(("127.0.0.1", port.into_inner()))
        .await
        .map_err(TransportError::Io)?;
    stream.write_all(&PROBE_MAGIC).await.map_err(TransportError::Io)?;

    let mut reply_magic = [0u8; 4];
    stream.read_exact(&mut reply_magic).await.map_err(TransportError::Io)?;
    if reply_magic != PROBE_MAGIC {
        return Err(AxedaError::Transport(TransportError::General("desktop probe magic mismatch".into())));
    }

    let version = stream.read_u32_le().await.map_err(TransportError::Io)?;
    let rfb_compatible = stream.read_u8().await.map_err(TransportError::Io)? != 0;
    let name_len = stream.read_u16_le().await.map_err(TransportError::Io)? as usize;
    let mut name_buf = vec![0u8; name_len];
    stream.read_exact(&mut name_buf).await.map_err(TransportError::Io)?;
    let platform_len = stream.read_u16_le().await.map_err(TransportError::Io)? as usize;
    let mut platform_buf = vec![0u8; platform_len];
    stream.read_exact(&mut platform_buf).await.map_err(TransportError::Io)?;

    Ok(DesktopProbeInfo {
        app_name: String::from_utf8_lossy(&name_buf).into_owned(),
        version,
        rfb_compatible,
        platform: String::from_utf8_lossy(&platform_buf).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_returns_none_when_nothing_listens() {
        let info = probe(ProbePort::new(1)).await;
        assert!(info.is_none());
    }

    #[tokio::test]
    async fn probe_parses_a_well_formed_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut magic = [0u8; 4];
            socket.read_exact(&mut magic).await.unwrap();
            assert_eq!(magic, PROBE_MAGIC);

            socket.write_all(&PROBE_MAGIC).await.unwrap();
            socket.write_u32_le(3).await.unwrap();
            socket.write_u8(1).await.unwrap();
            let name = b"ServiceLink Viewer";
            socket.write_u16_le(name.len() as u16).await.unwrap();
            socket.write_all(name).await.unwrap();
            let platform = b"linux-x86_64";
            socket.write_u16_le(platform.len() as u16).await.unwrap();
            socket.write_all(platform).await.unwrap();
        });

        let port = ProbePort::new(addr.port());
        let info = probe(port).await.expect("expected a parsed probe reply");
        assert_eq!(info.app_name, "ServiceLink Viewer");
        assert_eq!(info.version, 3);
        assert!(info.rfb_compatible);
        assert_eq!(info.platform, "linux-x86_64");
        server.await.unwrap();
    }
}
