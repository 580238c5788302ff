//! Remote-session wire protocol (§6 "Remote-session wire", §4.11).
//!
//! A fixed 16-byte header (`type`, `length`, `channel`, `padding`; all
//! little-endian `i32`) followed by a body that is either a command or up to
//! 4096 bytes of raw channel data. `length` is the unpadded payload size; the
//! body itself is zero-padded on the wire to the next 8-byte boundary, which
//! keeps every frame's total size a multiple of 8 without forcing the header
//! itself to carry the padded length (§6 "Body length is aligned up to 8
//! bytes on the wire; `length` is the unpadded length").

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::domain_types::ChannelId;
use crate::error::InternalError;

/// Fixed header size in bytes (§6).
pub const HEADER_LEN: usize = 16;
/// Largest raw-data payload a single frame may carry (§6 "up to 4096 bytes of data").
pub const MAX_DATA_PAYLOAD: usize = 4096;
/// Sentinel `channel` header value for frames that are not tied to a logical
/// channel (session-level commands like `Ping`/`SessionStart`).
pub const NO_CHANNEL: i32 = -1;

/// Discriminates a frame's payload shape (§6 "i32 type ∈ {1=data, 2=command, 3=user}").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data = 1,
    Command = 2,
    User = 3,
}

impl FrameKind {
    fn from_i32(v: i32) -> Result<Self, InternalError> {
        match v {
            1 => Ok(Self::Data),
            2 => Ok(Self::Command),
            3 => Ok(Self::User),
            other => Err(InternalError::InvalidArgument(format!("unknown frame type {other}"))),
        }
    }
}

/// Error code carried by a `Command::Error` reply (§4.11 "OpenSocket ... denies
/// with `aErrorAccess`/`aErrorInuse`/`aErrorAgain`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSessionErrorCode {
    /// The requested port is not the one this device advertised.
    Access,
    /// The channel id is already bound to an open socket.
    InUse,
    /// The device could not allocate/open the requested socket right now.
    Again,
}

impl RemoteSessionErrorCode {
    fn as_i32(self) -> i32 {
        match self {
            Self::Access => 1,
            Self::InUse => 2,
            Self::Again => 3,
        }
    }

    fn from_i32(v: i32) -> Result<Self, InternalError> {
        match v {
            1 => Ok(Self::Access),
            2 => Ok(Self::InUse),
            3 => Ok(Self::Again),
            other => Err(InternalError::InvalidArgument(format!("unknown remote-session error code {other}"))),
        }
    }
}

/// Control commands exchanged over a remote session (§4.11).
///
/// The source's wire union is `{basic{param}, error{code, text[]}}`; each
/// variant below is the concrete named command that union shape stands in
/// for, which reads more directly than reconstructing a generic tagged param.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Exchange protocol-version=1 at session open (§4.11).
    SessionStart { protocol_version: u32 },
    SessionStop,
    Ping,
    PingResponse,
    /// Server asks the device to open a logical socket to the given local port.
    OpenSocket { port: u16 },
    /// Either side asks to close a channel; also sent unsolicited by the device
    /// when a channel errors or closes asynchronously (§4.11).
    CloseSocket,
    Error { code: RemoteSessionErrorCode, text: Vec<String> },
}

const CMD_SESSION_START: i32 = 1;
const CMD_SESSION_STOP: i32 = 2;
const CMD_PING: i32 = 3;
const CMD_PING_RESPONSE: i32 = 4;
const CMD_OPEN_SOCKET: i32 = 5;
const CMD_CLOSE_SOCKET: i32 = 6;
const CMD_ERROR: i32 = 7;

impl Command {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Command::SessionStart { protocol_version } => {
                buf.put_i32_le(CMD_SESSION_START);
                buf.put_u32_le(*protocol_version);
            }
            Command::SessionStop => buf.put_i32_le(CMD_SESSION_STOP),
            Command::Ping => buf.put_i32_le(CMD_PING),
            Command::PingResponse => buf.put_i32_le(CMD_PING_RESPONSE),
            Command::OpenSocket { port } => {
                buf.put_i32_le(CMD_OPEN_SOCKET);
                buf.put_u16_le(*port);
            }
            Command::CloseSocket => buf.put_i32_le(CMD_CLOSE_SOCKET),
            Command::Error { code, text } => {
                buf.put_i32_le(CMD_ERROR);
                buf.put_i32_le(code.as_i32());
                buf.put_i32_le(i32::try_from(text.len()).unwrap_or(0));
                for line in text {
                    let bytes = line.as_bytes();
                    buf.put_i32_le(i32::try_from(bytes.len()).unwrap_or(0));
                    buf.put_slice(bytes);
                }
            }
        }
    }

    fn decode(mut body: Bytes) -> Result<Self, InternalError> {
        if body.len() < 4 {
            return Err(InternalError::InvalidArgument("command frame shorter than its tag".into()));
        }
        let tag = body.get_i32_le();
        match tag {
            CMD_SESSION_START => Ok(Command::SessionStart { protocol_version: body.get_u32_le() }),
            CMD_SESSION_STOP => Ok(Command::SessionStop),
            CMD_PING => Ok(Command::Ping),
            CMD_PING_RESPONSE => Ok(Command::PingResponse),
            CMD_OPEN_SOCKET => Ok(Command::OpenSocket { port: body.get_u16_le() }),
            CMD_CLOSE_SOCKET => Ok(Command::CloseSocket),
            CMD_ERROR => {
                let code = RemoteSessionErrorCode::from_i32(body.get_i32_le())?;
                let count = body.get_i32_le().max(0) as usize;
                let mut text = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = body.get_i32_le().max(0) as usize;
                    if body.remaining() < len {
                        return Err(InternalError::InvalidArgument("truncated error text".into()));
                    }
                    let raw = body.copy_to_bytes(len);
                    text.push(String::from_utf8_lossy(&raw).into_owned());
                }
                Ok(Command::Error { code, text })
            }
            other => Err(InternalError::InvalidArgument(format!("unknown command tag {other}"))),
        }
    }
}

/// One parsed frame: a command or up to [`MAX_DATA_PAYLOAD`] bytes of channel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Command(Command),
    Data(Bytes),
}

/// A full remote-session wire frame (§3 "Wire frame (remote session)").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// `None` for session-level frames (header's `channel` field is `NO_CHANNEL`).
    pub channel: Option<ChannelId>,
    pub payload: FramePayload,
}

impl Frame {
    #[must_use]
    pub fn command(channel: Option<ChannelId>, command: Command) -> Self {
        Self { channel, payload: FramePayload::Command(command) }
    }

    #[must_use]
    pub fn data(channel: ChannelId, bytes: Bytes) -> Self {
        Self { channel: Some(channel), payload: FramePayload::Data(bytes) }
    }

    fn kind(&self) -> FrameKind {
        match self.payload {
            FramePayload::Command(_) => FrameKind::Command,
            FramePayload::Data(_) => FrameKind::Data,
        }
    }

    /// Serializes the full frame (header + padded body) for writing to a transport.
    ///
    /// # Errors
    /// Returns [`InternalError::InvalidArgument`] if a data payload exceeds
    /// [`MAX_DATA_PAYLOAD`].
    pub fn encode(&self) -> Result<Bytes, InternalError> {
        let mut body = BytesMut::new();
        match &self.payload {
            FramePayload::Command(command) => command.encode(&mut body),
            FramePayload::Data(data) => {
                if data.len() > MAX_DATA_PAYLOAD {
                    return Err(InternalError::InvalidArgument(format!(
                        "data payload of {} bytes exceeds the {MAX_DATA_PAYLOAD}-byte frame limit",
                        data.len()
                    )));
                }
                body.put_slice(data);
            }
        }
        let length = body.len();
        let padded = pad_len(length);

        let mut out = BytesMut::with_capacity(HEADER_LEN + padded);
        out.put_i32_le(self.kind() as i32);
        out.put_i32_le(i32::try_from(length).unwrap_or(i32::MAX));
        out.put_i32_le(self.channel.map_or(NO_CHANNEL, |c| i32::from(u16::from(c))));
        out.put_i32_le(0); // reserved padding field in the header itself
        out.put_slice(&body);
        out.resize(HEADER_LEN + padded, 0);
        Ok(out.freeze())
    }

    /// Parses one frame's header out of an exactly-16-byte slice.
    ///
    /// # Errors
    /// Returns [`InternalError::InvalidArgument`] if `header` is the wrong
    /// length, names an unknown frame type, or the body is too large.
    pub fn parse_header(header: &[u8]) -> Result<FrameHeader, InternalError> {
        if header.len() != HEADER_LEN {
            return Err(InternalError::InvalidArgument(format!("remote-session header must be {HEADER_LEN} bytes")));
        }
        let mut buf = header;
        let kind = FrameKind::from_i32(buf.get_i32_le())?;
        let length = buf.get_i32_le();
        if length < 0 || length as usize > MAX_DATA_PAYLOAD.max(HEADER_LEN * 64) {
            return Err(InternalError::InvalidArgument(format!("implausible remote-session frame length {length}")));
        }
        let channel_raw = buf.get_i32_le();
        let _reserved = buf.get_i32_le();
        let channel = if channel_raw == NO_CHANNEL {
            None
        } else {
            Some(ChannelId::try_new(u16::try_from(channel_raw).map_err(|_| InternalError::InvalidArgument("channel id out of range".into()))?)
                .map_err(|e| InternalError::InvalidArgument(e.to_string()))?)
        };
        Ok(FrameHeader { kind, length: length as usize, channel })
    }

    /// Reassembles a [`Frame`] from a header plus the (unpadded-length) body
    /// bytes already read off the wire.
    ///
    /// # Errors
    /// Returns [`InternalError::InvalidArgument`] if the body does not parse
    /// as a well-formed command for a `Command`-kind header.
    pub fn from_header_and_body(header: FrameHeader, body: Bytes) -> Result<Self, InternalError> {
        let payload = match header.kind {
            FrameKind::Command => FramePayload::Command(Command::decode(body)?),
            FrameKind::Data | FrameKind::User => FramePayload::Data(body),
        };
        Ok(Self { channel: header.channel, payload })
    }
}

/// Parsed 16-byte frame header, before the (possibly padded) body has been read.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub kind: FrameKind,
    /// Unpadded payload length as declared on the wire.
    pub length: usize,
    pub channel: Option<ChannelId>,
}

impl FrameHeader {
    /// Total bytes to read off the wire for this frame's body, including padding.
    #[must_use]
    pub fn padded_len(&self) -> usize {
        self.length + pad_len(self.length)
    }
}

fn pad_len(length: usize) -> usize {
    (8 - (length % 8)) % 8
}

/// Drains as many complete frames as `buf` currently holds, leaving any
/// trailing partial frame in place for the next read. Used by the HTTP
/// long-poll transport, where one response body may carry several frames
/// back to back and may also end mid-frame (§4.11 "two long-poll HTTP
/// requests ... carrying the same frame stream as the direct transport").
///
/// # Errors
/// Returns [`InternalError::InvalidArgument`] if a complete frame fails to parse.
pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<Frame>, InternalError> {
    let mut frames = Vec::new();
    loop {
        if buf.len() < HEADER_LEN {
            break;
        }
        let header = Frame::parse_header(&buf[..HEADER_LEN])?;
        let total = HEADER_LEN + header.padded_len();
        if buf.len() < total {
            break;
        }
        let mut framed = buf.split_to(total);
        framed.advance(HEADER_LEN);
        let body = framed.split_to(header.length).freeze();
        frames.push(Frame::from_header_and_body(header, body)?);
    }
    Ok(frames)
}
