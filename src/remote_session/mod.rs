//! C11: `RemoteSession` — multiplexes one or more desktop-like TCP sockets
//! over a server-initiated session, choosing between a direct connection and
//! an HTTP long-poll fallback (§4.11).

pub mod channel;
pub mod desktop_probe;
pub mod transport;
pub mod wire;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::domain_types::{ChannelId, DeviceId, PingIntervalMs, ProbePort, ServerConfigId, SessionTimeoutMs};
use crate::emessage::render_desktop_app_item;
use crate::error::{AxedaError, TransportError};
use crate::queue::{ItemKind, MessageQueue};
use crate::remote_session::channel::Channel;
use crate::remote_session::transport::Transport;
use crate::remote_session::wire::{Command, Frame, FramePayload, RemoteSessionErrorCode, MAX_DATA_PAYLOAD};
use crate::user_agent::UserAgent;

/// What kind of peer the device expects to find listening on `advertised_port`
/// (§4.11 "a desktop remote-control viewer or a bare application socket").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Desktop,
    Application,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Initial,
    Connecting,
    Active,
    Stopping,
    Done,
}

/// Static identity and endpoint for one remote session (§4.11).
#[derive(Debug, Clone)]
pub struct RemoteSessionConfig {
    pub device_id: DeviceId,
    pub server_config_id: ServerConfigId,
    pub interface: InterfaceType,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub path: String,
    pub session_id: String,
    /// The single local port this device advertises for the session (§4.11
    /// "OpenSocket for any other port is denied with `aErrorAccess`").
    pub advertised_port: u16,
    pub probe_port: ProbePort,
    pub ping_interval: PingIntervalMs,
    pub session_timeout: SessionTimeoutMs,
    pub connect_timeout: Duration,
}

/// A server-initiated remote-control/tunnel session multiplexing channels
/// over one [`Transport`] (§3 "RemoteSession", §4.11).
pub struct RemoteSession {
    config: RemoteSessionConfig,
    queue: MessageQueue,
    user_agent: Arc<UserAgent>,
    state: Mutex<SessionState>,
    channels: Mutex<HashMap<ChannelId, Channel>>,
    transport: Mutex<Option<Transport>>,
    last_activity: Mutex<Instant>,
}

impl RemoteSession {
    #[must_use]
    pub fn new(config: RemoteSessionConfig, queue: MessageQueue, user_agent: Arc<UserAgent>) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            user_agent,
            state: Mutex::new(SessionState::Initial),
            channels: Mutex::new(HashMap::new()),
            transport: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    /// Probes for a local desktop application, establishes the transport
    /// (direct, falling back to HTTP long-poll), exchanges `SessionStart`, and
    /// spawns the two cooperative tasks that drive the session thereafter
    /// (§4.11, §9 "two cooperative threads sharing one transport").
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), AxedaError> {
        if matches!(self.config.interface, InterfaceType::Desktop) {
            if let Some(info) = desktop_probe::probe(self.config.probe_port).await {
                let content = render_desktop_app_item(&info.app_name, info.version, info.rfb_compatible, &info.platform);
                if let Err(err) = self
                    .queue
                    .add(ItemKind::Misc, self.config.device_id, self.config.server_config_id, crate::domain_types::Priority::Normal, Bytes::from(content))
                    .await
                {
                    warn!(error = %err, "dropping desktop-app announcement: queue is full");
                }
            }
        }

        *self.state.lock().await = SessionState::Connecting;
        let transport = Transport::establish(
            &self.config.host,
            self.config.port,
            self.config.tls,
            &self.config.path,
            &self.config.session_id,
            Arc::clone(&self.user_agent),
            self.config.connect_timeout,
        )
        .await?;
        *self.transport.lock().await = Some(transport);

        self.send_command(None, Command::SessionStart { protocol_version: 1 }).await?;
        *self.state.lock().await = SessionState::Active;
        *self.last_activity.lock().await = Instant::now();

        let reader = Arc::clone(self);
        tokio::spawn(async move { reader.run_transport_loop().await });
        let pinger = Arc::clone(self);
        tokio::spawn(async move { pinger.run_channel_loop().await });
        Ok(())
    }

    /// Reads inbound frames off the transport and dispatches each (§4.11).
    async fn run_transport_loop(self: Arc<Self>) {
        loop {
            if matches!(*self.state.lock().await, SessionState::Done) {
                break;
            }
            let frames = {
                let mut guard = self.transport.lock().await;
                match guard.as_mut() {
                    Some(t) => t.receive_frames().await,
                    None => break,
                }
            };
            match frames {
                Ok(frames) => {
                    *self.last_activity.lock().await = Instant::now();
                    for frame in frames {
                        self.handle_frame(frame).await;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "remote session transport read failed, stopping session");
                    *self.state.lock().await = SessionState::Done;
                    break;
                }
            }
        }
    }

    /// The channel thread (§4.11 "poll-channels → {upload-data |
    /// send-async-message} → poll-channels"): polls every bound local socket
    /// for outbound data and forwards it as `Data` frames, injecting an idle
    /// `Ping` every `ping_interval` only when no other outbound traffic
    /// happened in that window (§4.11 "Ping ... keeps NAT/idle-proxy state
    /// alive"). Also force-stops the session once `session_timeout` has
    /// elapsed with no inbound activity (§5 "Cancellation and timeouts").
    async fn run_channel_loop(self: Arc<Self>) {
        let mut poll_interval = tokio::time::interval(Duration::from_millis(50));
        let mut last_outbound = Instant::now();
        loop {
            poll_interval.tick().await;
            if matches!(*self.state.lock().await, SessionState::Done | SessionState::Stopping) {
                break;
            }
            let idle_for = self.last_activity.lock().await.elapsed();
            let timeout = self.config.session_timeout.as_duration();
            if !timeout.is_zero() && idle_for > timeout {
                warn!(?idle_for, "remote session timed out, stopping");
                let _ = self.stop().await;
                break;
            }

            if self.poll_channels_outbound().await {
                last_outbound = Instant::now();
                continue;
            }
            if last_outbound.elapsed() >= self.config.ping_interval.as_duration() {
                if self.send_command(None, Command::Ping).await.is_err() {
                    break;
                }
                last_outbound = Instant::now();
            }
        }
    }

    /// Reads whatever is immediately available off each channel's bound local
    /// socket and forwards it as one or more `Data` frames, splitting at
    /// [`MAX_DATA_PAYLOAD`] (§6 "up to 4096 bytes of data"). A local EOF or
    /// read error marks the channel closed/errored and sends an unsolicited
    /// `CloseSocket` upstream (§4.11 "device sends unsolicited CloseSocket on
    /// local error/close"). Returns whether any outbound frame was sent, so
    /// the caller can suppress the idle ping accordingly.
    async fn poll_channels_outbound(&self) -> bool {
        let handles: Vec<(ChannelId, Arc<Mutex<TcpStream>>)> =
            { self.channels.lock().await.iter().filter_map(|(id, c)| c.local().map(|s| (*id, s))).collect() };

        let mut sent_any = false;
        for (channel_id, socket) in handles {
            let mut buf = [0u8; MAX_DATA_PAYLOAD];
            let outcome = {
                let guard = socket.lock().await;
                guard.try_read(&mut buf)
            };
            match outcome {
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Ok(0) => {
                    if let Some(channel) = self.channels.lock().await.get_mut(&channel_id) {
                        channel.mark_closed();
                    }
                    let _ = self.send_command(Some(channel_id), Command::CloseSocket).await;
                    sent_any = true;
                }
                Ok(n) => {
                    if self.send_data(channel_id, Bytes::copy_from_slice(&buf[..n])).await.is_ok() {
                        sent_any = true;
                    }
                }
                Err(err) => {
                    warn!(error = %err, ?channel_id, "local socket read failed, closing channel");
                    if let Some(channel) = self.channels.lock().await.get_mut(&channel_id) {
                        channel.mark_error();
                    }
                    let _ = self.send_command(Some(channel_id), Command::CloseSocket).await;
                    sent_any = true;
                }
            }
        }
        sent_any
    }

    async fn handle_frame(&self, frame: Frame) {
        match frame.payload {
            FramePayload::Command(Command::Ping) => {
                let _ = self.send_command(frame.channel, Command::PingResponse).await;
            }
            FramePayload::Command(Command::PingResponse | Command::SessionStart { .. }) => {}
            FramePayload::Command(Command::SessionStop) => {
                *self.state.lock().await = SessionState::Stopping;
            }
            FramePayload::Command(Command::OpenSocket { port }) => self.handle_open_socket(frame.channel, port).await,
            FramePayload::Command(Command::CloseSocket) => self.handle_close_socket(frame.channel).await,
            FramePayload::Command(Command::Error { code, text }) => {
                warn!(?code, ?text, "peer reported a remote-session error");
            }
            FramePayload::Data(bytes) => self.handle_channel_data(frame.channel, bytes).await,
        }
    }

    /// Handles a server-requested `OpenSocket`, applying the access-control
    /// decision in [`decide_open_socket`] before dialing the local port
    /// (§4.11 "OpenSocket(port) ... aErrorAccess / aErrorInuse / aErrorAgain").
    async fn handle_open_socket(&self, channel_id: Option<ChannelId>, port: u16) {
        let Some(channel_id) = channel_id else {
            warn!("OpenSocket received without a channel id, ignoring");
            return;
        };
        let already_open = self.channels.lock().await.get(&channel_id).is_some_and(Channel::is_open);

        if let Err(code) = decide_open_socket(self.config.advertised_port, port, already_open) {
            let _ = self
                .send_command(Some(channel_id), Command::Error { code, text: vec![error_reason(code)] })
                .await;
            return;
        }

        match TcpStream::connect(("127.0.0.1", self.config.advertised_port)).await {
            Ok(stream) => {
                let mut channels = self.channels.lock().await;
                let channel = channels.entry(channel_id).or_insert_with(|| Channel::new(channel_id));
                channel.bind_local(stream);
            }
            Err(err) => {
                warn!(error = %err, port = self.config.advertised_port, "local dial for OpenSocket failed");
                let _ = self
                    .send_command(Some(channel_id), Command::Error { code: RemoteSessionErrorCode::Again, text: vec![err.to_string()] })
                    .await;
            }
        }
    }

    async fn handle_close_socket(&self, channel_id: Option<ChannelId>) {
        let Some(channel_id) = channel_id else { return };
        if let Some(channel) = self.channels.lock().await.get_mut(&channel_id) {
            channel.mark_closed();
        }
    }

    /// Forwards data arriving on a channel to its bound local socket; an
    /// unsolicited `CloseSocket` is sent back if the local side has since
    /// errored or closed (§4.11 "device sends unsolicited CloseSocket on
    /// local error/close").
    async fn handle_channel_data(&self, channel_id: Option<ChannelId>, data: Bytes) {
        let Some(channel_id) = channel_id else { return };
        let Some(local) = self.channels.lock().await.get(&channel_id).and_then(Channel::local) else {
            let _ = self.send_command(Some(channel_id), Command::CloseSocket).await;
            return;
        };

        use tokio::io::AsyncWriteExt;
        let write_result = local.lock().await.write_all(&data).await;
        if write_result.is_err() {
            if let Some(channel) = self.channels.lock().await.get_mut(&channel_id) {
                channel.mark_error();
            }
            let _ = self.send_command(Some(channel_id), Command::CloseSocket).await;
        }
    }

    async fn send_command(&self, channel: Option<ChannelId>, command: Command) -> Result<(), AxedaError> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(AxedaError::Transport(TransportError::NotConnected))?;
        transport.send_frame(&Frame::command(channel, command)).await
    }

    async fn send_data(&self, channel: ChannelId, data: Bytes) -> Result<(), AxedaError> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(AxedaError::Transport(TransportError::NotConnected))?;
        transport.send_frame(&Frame::data(channel, data)).await
    }

    /// Gracefully tears down the session: sends `SessionStop` and marks the
    /// session done so both background loops exit (§4.11).
    pub async fn stop(&self) -> Result<(), AxedaError> {
        *self.state.lock().await = SessionState::Stopping;
        let result = self.send_command(None, Command::SessionStop).await;
        *self.state.lock().await = SessionState::Done;
        result
    }
}

/// Pure access-control decision for a server-requested `OpenSocket`, kept
/// free of I/O so it can be tested directly (§4.11).
fn decide_open_socket(advertised_port: u16, requested_port: u16, already_open: bool) -> Result<(), RemoteSessionErrorCode> {
    if requested_port != advertised_port {
        return Err(RemoteSessionErrorCode::Access);
    }
    if already_open {
        return Err(RemoteSessionErrorCode::InUse);
    }
    Ok(())
}

fn error_reason(code: RemoteSessionErrorCode) -> String {
    match code {
        RemoteSessionErrorCode::Access => "requested port does not match the advertised port".to_string(),
        RemoteSessionErrorCode::InUse => "channel is already bound to an open socket".to_string(),
        RemoteSessionErrorCode::Again => "local socket could not be opened".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_socket_for_wrong_port_is_denied_with_access_error() {
        // Scenario: server opens a session and sends OpenSocket for a port the
        // device never advertised. Expect Error(Access), no socket considered open.
        let decision = decide_open_socket(5900, 22, false);
        assert_eq!(decision, Err(RemoteSessionErrorCode::Access));
    }

    #[test]
    fn open_socket_for_advertised_port_succeeds_when_not_already_open() {
        let decision = decide_open_socket(5900, 5900, false);
        assert_eq!(decision, Ok(()));
    }

    #[test]
    fn open_socket_for_already_open_channel_is_denied_with_in_use_error() {
        let decision = decide_open_socket(5900, 5900, true);
        assert_eq!(decision, Err(RemoteSessionErrorCode::InUse));
    }
}
