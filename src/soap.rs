//! C8: `SoapDispatcher` — parses a server response bundle and dispatches SOAP
//! methods to built-in or user-registered handlers (§4.8).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{instrument, warn};

use crate::domain_types::{DeviceId, Priority, ServerConfigId};
use crate::emessage::format_timestamp;
use crate::error::HttpError;
use crate::queue::{ItemKind, MessageQueue};

/// One method call extracted from `SOAP-ENV:Envelope/SOAP-ENV:Body` (§4.8).
#[derive(Debug, Clone)]
pub struct ParsedCommand {
    pub command_id: String,
    pub user_id: String,
    pub method: String,
    pub attrs: HashMap<String, String>,
}

/// Result of dispatching one [`ParsedCommand`] to a handler; becomes a
/// `SoapCommandStatus` queue item (§4.8).
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status_code: u32,
    pub reason: String,
}

impl CommandResult {
    #[must_use]
    pub fn ok() -> Self {
        Self { status_code: 0, reason: String::new() }
    }

    #[must_use]
    pub fn failed(status_code: u32, reason: impl Into<String>) -> Self {
        Self { status_code, reason: reason.into() }
    }
}

/// Application hook for the built-in SOAP methods plus a catch-all for
/// everything else (§4.8 "otherwise dispatch to the user-registered
/// catch-all").
#[async_trait]
pub trait SoapCommandHandler: Send + Sync {
    async fn set_tag(&self, name: &str, value: &str) -> CommandResult;
    async fn set_time(&self, timestamp: &str) -> CommandResult;
    async fn restart(&self, hard: bool) -> CommandResult;
    async fn file_transfer_start(&self, attrs: &HashMap<String, String>) -> CommandResult;
    async fn file_transfer_stop(&self, attrs: &HashMap<String, String>) -> CommandResult;
    async fn file_transfer_pause(&self, attrs: &HashMap<String, String>) -> CommandResult;
    async fn remote_session_start(&self, attrs: &HashMap<String, String>) -> CommandResult;
    async fn catch_all(&self, method: &str, attrs: &HashMap<String, String>) -> CommandResult;
}

/// Parses [`ParsedCommand`]s out of a raw response body and dispatches each to
/// `handler`, enqueueing a `SoapCommandStatus` item per dispatch (§4.8).
pub struct SoapDispatcher {
    handler: Arc<dyn SoapCommandHandler>,
    queue: MessageQueue,
}

impl SoapDispatcher {
    #[must_use]
    pub fn new(handler: Arc<dyn SoapCommandHandler>, queue: MessageQueue) -> Self {
        Self { handler, queue }
    }

    /// Parses and dispatches every method in `body`, then enqueues a
    /// `soap-status` item per dispatch (§3 "Outbound queue item", §4.8).
    #[instrument(skip(self, body))]
    pub async fn dispatch_bundle(
        &self,
        body: &[u8],
        device_id: DeviceId,
        server_config_id: ServerConfigId,
    ) -> Result<usize, HttpError> {
        let commands = parse_bundle(body)?;
        let count = commands.len();
        for command in commands {
            let result = self.dispatch_one(&command).await;
            let status_xml = render_status(&command, &result);
            if let Err(err) = self
                .queue
                .add(ItemKind::SoapStatus, device_id, server_config_id, Priority::High, status_xml)
                .await
            {
                warn!(error = %err, "dropping soap-command-status: queue is full");
            }
        }
        Ok(count)
    }

    async fn dispatch_one(&self, command: &ParsedCommand) -> CommandResult {
        match command.method.as_str() {
            "SetTag" => {
                let name = command.attrs.get("name").map(String::as_str).unwrap_or_default();
                let value = command.attrs.get("value").map(String::as_str).unwrap_or_default();
                self.handler.set_tag(name, value).await
            }
            "SetTime" => {
                let timestamp = command.attrs.get("time").map(String::as_str).unwrap_or_default();
                self.handler.set_time(timestamp).await
            }
            "Restart" => {
                let hard = command.attrs.get("ha").is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
                self.handler.restart(hard).await
            }
            "FileTransfer.Start" => self.handler.file_transfer_start(&command.attrs).await,
            "FileTransfer.Stop" => self.handler.file_transfer_stop(&command.attrs).await,
            "FileTransfer.Pause" => self.handler.file_transfer_pause(&command.attrs).await,
            "RemoteSession.Start" => self.handler.remote_session_start(&command.attrs).await,
            other => self.handler.catch_all(other, &command.attrs).await,
        }
    }
}

/// Renders a `<Ps cid=.. uid=.. sc=HEX reason=.. t=..>` status element. The
/// status code is hex-formatted, matching the source's `CreateSOAPCommandStatus`
/// (§10.8), not the decimal formatting one might otherwise expect.
fn render_status(command: &ParsedCommand, result: &CommandResult) -> Bytes {
    let timestamp = format_timestamp(std::time::SystemTime::now(), crate::config::ServerTimestampMode::Device);
    let xml = format!(
        "<Ps cid=\"{}\" uid=\"{}\" sc=\"{:X}\" reason=\"{}\" t=\"{}\"/>",
        escape(&command.command_id),
        escape(&command.user_id),
        result.status_code,
        escape(&result.reason),
        timestamp
    );
    Bytes::from(xml.into_bytes())
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Parses `SOAP-ENV:Envelope/SOAP-ENV:Body/<method .../>` into a flat list of
/// commands (§4.8). Method elements may be self-closed or carry children;
/// children are ignored (no built-in method body uses nested elements).
fn parse_bundle(body: &[u8]) -> Result<Vec<ParsedCommand>, HttpError> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut commands = Vec::new();
    let mut in_body = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = local_name(e.name().as_ref());
                if name == "Body" {
                    in_body = true;
                    continue;
                }
                if !in_body || name == "Envelope" {
                    continue;
                }
                let mut attrs = HashMap::new();
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr
                        .decode_and_unescape_value(reader.decoder())
                        .map_err(|err| HttpError::BadResponse(err.to_string()))?
                        .to_string();
                    attrs.insert(key, value);
                }
                let command_id = attrs.remove("cid").unwrap_or_default();
                let user_id = attrs.remove("uid").unwrap_or_default();
                commands.push(ParsedCommand { command_id, user_id, method: name, attrs });
            }
            Ok(Event::End(e)) => {
                if local_name(e.name().as_ref()) == "Body" {
                    in_body = false;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(HttpError::BadResponse(err.to_string())),
        }
        buf.clear();
    }
    Ok(commands)
}

fn local_name(qualified: &[u8]) -> String {
    let s = String::from_utf8_lossy(qualified);
    match s.rsplit_once(':') {
        Some((_, local)) => local.to_string(),
        None => s.to_string(),
    }
}

/// Looks for a `<Re r="seconds" .../>` element anywhere in a registration
/// response and returns its rate in seconds, if present (§4.7 "the server
/// returned a new ping rate"). The source's registration request carries its
/// ping rate this way (`AeDRMEMessageCreateRegistrationElement`'s `r`
/// attribute, mirrored by [`crate::emessage::EMessageBuilder::add_registration`]);
/// a conforming server acknowledges a rate change by echoing the same element
/// back, outside the SOAP command bundle rather than as a dispatched method.
#[must_use]
pub fn parse_ping_rate_update(body: &[u8]) -> Option<u32> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if local_name(e.name().as_ref()) != "Re" {
                    continue;
                }
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"r" {
                        let value = attr.decode_and_unescape_value(reader.decoder()).ok()?;
                        return value.parse().ok();
                    }
                }
                return None;
            }
            Ok(Event::Eof) => return None,
            Ok(_) => {}
            Err(_) => return None,
        }
        buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> DeviceId {
        DeviceId::new(0)
    }
    fn cfg() -> ServerConfigId {
        ServerConfigId::new(0)
    }

    struct RecordingHandler;

    #[async_trait]
    impl SoapCommandHandler for RecordingHandler {
        async fn set_tag(&self, _name: &str, _value: &str) -> CommandResult {
            CommandResult::ok()
        }
        async fn set_time(&self, _timestamp: &str) -> CommandResult {
            CommandResult::ok()
        }
        async fn restart(&self, _hard: bool) -> CommandResult {
            CommandResult::ok()
        }
        async fn file_transfer_start(&self, _attrs: &HashMap<String, String>) -> CommandResult {
            CommandResult::ok()
        }
        async fn file_transfer_stop(&self, _attrs: &HashMap<String, String>) -> CommandResult {
            CommandResult::ok()
        }
        async fn file_transfer_pause(&self, _attrs: &HashMap<String, String>) -> CommandResult {
            CommandResult::ok()
        }
        async fn remote_session_start(&self, _attrs: &HashMap<String, String>) -> CommandResult {
            CommandResult::ok()
        }
        async fn catch_all(&self, _method: &str, _attrs: &HashMap<String, String>) -> CommandResult {
            CommandResult::failed(1, "unrecognized method")
        }
    }

    #[test]
    fn parses_set_tag_from_envelope() {
        let body = br#"<SOAP-ENV:Envelope><SOAP-ENV:Body><SetTag cid="c1" uid="u1" name="foo" value="bar"/></SOAP-ENV:Body></SOAP-ENV:Envelope>"#;
        let commands = parse_bundle(body).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].method, "SetTag");
        assert_eq!(commands[0].command_id, "c1");
        assert_eq!(commands[0].attrs.get("name").unwrap(), "foo");
    }

    #[test]
    fn parses_multiple_methods_in_one_body() {
        let body = br#"<SOAP-ENV:Envelope><SOAP-ENV:Body>
            <SetTime cid="c1" uid="u1" time="systime"/>
            <Restart cid="c2" uid="u1" ha="1"/>
        </SOAP-ENV:Body></SOAP-ENV:Envelope>"#;
        let commands = parse_bundle(body).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].method, "Restart");
    }

    #[tokio::test]
    async fn unknown_method_reaches_catch_all_and_enqueues_status() {
        let queue = MessageQueue::new(crate::domain_types::QueueByteBudget::try_new(4096).unwrap());
        let dispatcher = SoapDispatcher::new(Arc::new(RecordingHandler), queue.clone());
        let body = br#"<SOAP-ENV:Envelope><SOAP-ENV:Body><Some.Unknown cid="c1" uid="u1"/></SOAP-ENV:Body></SOAP-ENV:Envelope>"#;
        let count = dispatcher.dispatch_bundle(body, dev(), cfg()).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(queue.len().await, 1);
    }

    #[test]
    fn ping_rate_update_parses_rate_from_re_element() {
        let body = br#"<Re r="120" t="systime" y="0"/>"#;
        assert_eq!(parse_ping_rate_update(body), Some(120));
    }

    #[test]
    fn ping_rate_update_absent_when_no_re_element() {
        let body = br#"<SOAP-ENV:Envelope><SOAP-ENV:Body><SetTag cid="c1" uid="u1" name="foo" value="bar"/></SOAP-ENV:Body></SOAP-ENV:Envelope>"#;
        assert_eq!(parse_ping_rate_update(body), None);
    }

    #[test]
    fn status_code_renders_as_hex() {
        let command = ParsedCommand {
            command_id: "c1".into(),
            user_id: "u1".into(),
            method: "SetTag".into(),
            attrs: HashMap::new(),
        };
        let xml = render_status(&command, &CommandResult::failed(255, "boom"));
        assert!(String::from_utf8_lossy(&xml).contains("sc=\"FF\""));
    }
}
