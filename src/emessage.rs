//! C6: `EMessageBuilder` — coalesces queued items into a size-capped XML
//! envelope per (device, server-config) (§4.6).
//!
//! Builds each element with `quick-xml`'s `Writer` (so attribute/text escaping
//! is never hand-rolled) but measures every candidate element's serialized size
//! *before* committing it to the document, which is the streaming-writer
//! equivalent of the source's "walk the XML tree to measure size" (§9).

use std::collections::HashMap;
use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use rust_decimal::Decimal;

use crate::config::ServerTimestampMode;
use crate::domain_types::{DeviceId, EMessageByteBudget};

/// A data item's type classification (§10.8, `AeDRMEMessage.c`'s `AddDataItem`
/// switch over `pDataItem->value.iType`).
#[derive(Debug, Clone, PartialEq)]
pub enum DataItemValue {
    /// Exact decimal reading; rendered with trailing zeros (and a trailing
    /// `.` for whole numbers) trimmed, matching the original's
    /// `AeTrimRight(pTmp1, '0'); AeTrimRight(pTmp1, '.')` after `%f`-formatting.
    Analog(Decimal),
    Digital(bool),
    String(String),
}

impl DataItemValue {
    fn type_code(&self) -> &'static str {
        match self {
            DataItemValue::Analog(_) => "a",
            DataItemValue::Digital(_) => "d",
            DataItemValue::String(_) => "s",
        }
    }

    fn rendered(&self) -> String {
        match self {
            DataItemValue::Analog(d) => d.normalize().to_string(),
            DataItemValue::Digital(b) => u8::from(*b).to_string(),
            DataItemValue::String(s) => s.clone(),
        }
    }
}

/// A data item's quality flag (§10.8, `AeDRMEMessage.c`'s `iQuality` switch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataItemQuality {
    Good,
    Bad,
    Uncertain,
}

impl DataItemQuality {
    fn code(self) -> &'static str {
        match self {
            DataItemQuality::Good => "g",
            DataItemQuality::Bad => "b",
            DataItemQuality::Uncertain => "u",
        }
    }
}

/// Which document root this builder is assembling (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EMessageKind {
    /// `<Ea id=N rc=0 v=M.m>` — standard telemetry/status message.
    Standard,
    /// `<MT id=N>` — maintenance message.
    Maintenance,
}

struct DeviceBuilder {
    mn: String,
    sn: String,
    ow: String,
    body: Vec<u8>,
    seen_first_data_item: bool,
}

/// Formats an ISO-8601 UTC timestamp with millisecond precision (§4.6
/// "Timestamps"), or the literal `systime` token when the server is expected to
/// substitute its own clock (§10.8).
#[must_use]
pub fn format_timestamp(time: SystemTime, mode: ServerTimestampMode) -> String {
    if matches!(mode, ServerTimestampMode::Server) {
        return "systime".to_string();
    }
    let millis = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0); // §4.6: "before the epoch" clamps to zero.
    let total_seconds = (millis / 1000) as i64;
    let ms = (millis % 1000) as u32;
    let (y, mo, d, h, mi, s) = civil_from_unix(total_seconds);
    format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}.{ms:03}Z")
}

/// Converts a Unix timestamp (seconds) into a proleptic-Gregorian civil
/// date/time tuple, using Howard Hinnant's `civil_from_days` algorithm so the
/// crate needs no `chrono`/`time` dependency for this one conversion.
fn civil_from_unix(unix_seconds: i64) -> (i64, u32, u32, u32, u32, u32) {
    let seconds_of_day = unix_seconds.rem_euclid(86400);
    let days = (unix_seconds - seconds_of_day) / 86400;
    let h = (seconds_of_day / 3600) as u32;
    let mi = ((seconds_of_day % 3600) / 60) as u32;
    let s = (seconds_of_day % 60) as u32;

    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d, h, mi, s)
}

/// Assembles one bounded XML envelope (§3 "EMessage", §4.6).
pub struct EMessageBuilder {
    kind: EMessageKind,
    id: u64,
    protocol_version: &'static str,
    budget: usize,
    used: usize,
    devices: Vec<DeviceId>,
    device_builders: HashMap<DeviceId, DeviceBuilder>,
}

impl EMessageBuilder {
    #[must_use]
    pub fn new(kind: EMessageKind, id: u64, budget: EMessageByteBudget) -> Self {
        Self {
            kind,
            id,
            protocol_version: "6.5",
            budget: budget.as_usize(),
            used: 0,
            devices: Vec::new(),
            device_builders: HashMap::new(),
        }
    }

    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn remaining_bytes(&self) -> usize {
        self.budget.saturating_sub(self.used)
    }

    fn device_mut(&mut self, device_id: DeviceId) -> &mut DeviceBuilder {
        if !self.device_builders.contains_key(&device_id) {
            self.devices.push(device_id);
            self.device_builders.insert(
                device_id,
                DeviceBuilder {
                    mn: String::new(),
                    sn: String::new(),
                    ow: String::new(),
                    body: Vec::new(),
                    seen_first_data_item: false,
                },
            );
        }
        self.device_builders.get_mut(&device_id).unwrap()
    }

    /// Sets the `<De mn=.. sn=.. ow=..>` identity for `device_id`, creating its
    /// sub-element on first touch (§4.6 "Per device, a `<De>` sub-element is
    /// created on first touch").
    pub fn set_device_identity(&mut self, device_id: DeviceId, mn: &str, sn: &str, ow: &str) {
        let device = self.device_mut(device_id);
        device.mn = mn.to_string();
        device.sn = sn.to_string();
        device.ow = ow.to_string();
    }

    /// Attempts to append a pre-rendered content element under `device_id`.
    /// `exempt_from_budget` is true only for the first `data` item added to a
    /// given device (§4.6 "Exception").
    fn try_append(&mut self, device_id: DeviceId, element: Vec<u8>, exempt_from_budget: bool) -> bool {
        let size = element.len();
        if !exempt_from_budget && self.used + size > self.budget {
            return false;
        }
        let device = self.device_mut(device_id);
        device.body.extend_from_slice(&element);
        self.used += size;
        true
    }

    /// Appends a `<Re r=rate t=timestamp y=type>` registration element (§4.6).
    pub fn add_registration(&mut self, device_id: DeviceId, rate: u32, timestamp: &str, reg_type: u32) -> bool {
        let xml = render_empty(
            "Re",
            &[("r", rate.to_string()), ("t", timestamp.to_string()), ("y", reg_type.to_string())],
        );
        self.try_append(device_id, xml, false)
    }

    /// Appends an already-serialized content element verbatim, subject to the
    /// ordinary budget check (no exemption). Used for queued items that
    /// arrive pre-rendered — alarms, events, SOAP-command-status — rather
    /// than built by one of the typed helpers below (§3 "serialized-content
    /// bytes").
    pub fn add_raw_content(&mut self, device_id: DeviceId, content: &[u8]) -> bool {
        self.try_append(device_id, content.to_vec(), false)
    }

    /// Appends a `<Pi t=timestamp>` ping element (§4.6).
    pub fn add_ping(&mut self, device_id: DeviceId, timestamp: &str) -> bool {
        let xml = render_empty("Pi", &[("t", timestamp.to_string())]);
        self.try_append(device_id, xml, false)
    }

    /// Appends a `<Ds ol=0|1>` online-status element (§4.6).
    pub fn add_online(&mut self, device_id: DeviceId, online: bool) -> bool {
        let xml = render_empty("Ds", &[("ol", u8::from(online).to_string())]);
        self.try_append(device_id, xml, false)
    }

    /// Appends an (always present, possibly empty) `<Md>` managed-device
    /// container (§4.6). The `<Cs/>` empty-element quirk (§10.8) is required
    /// even when `managed_device_ids` is empty, or the server-side registration
    /// parser rejects the message.
    pub fn add_managed_devices(&mut self, device_id: DeviceId, managed_device_ids: &[u32]) -> bool {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer.write_event(Event::Start(BytesStart::new("Md"))).unwrap();
        if managed_device_ids.is_empty() {
            writer
                .write_event(Event::Empty(BytesStart::new("Cs")))
                .unwrap();
        } else {
            for id in managed_device_ids {
                writer
                    .write_event(Event::Empty(
                        BytesStart::new("Cs").with_attributes([("id", id.to_string().as_str())]),
                    ))
                    .unwrap();
            }
        }
        writer.write_event(Event::End(BytesEnd::new("Md"))).unwrap();
        let xml = writer.into_inner().into_inner();
        self.try_append(device_id, xml, false)
    }

    /// Appends a `data` character-value item. The first data item for a device
    /// in this message is added unconditionally (§4.6 "Exception").
    ///
    /// The value is rendered as character data rather than an attribute, with
    /// `ty`/`q` attributes carrying the type and quality codes, matching
    /// `AeDRMEMessage.c`'s `AddDataItem` (§10.8). Analog values are trimmed via
    /// [`rust_decimal::Decimal::normalize`], the source's `AeTrimRight` calls.
    pub fn add_data(
        &mut self,
        device_id: DeviceId,
        name: &str,
        value: &DataItemValue,
        quality: DataItemQuality,
        timestamp: &str,
    ) -> bool {
        let xml = render_char_data(
            "DI",
            &[
                ("n", name.to_string()),
                ("t", timestamp.to_string()),
                ("ty", value.type_code().to_string()),
                ("q", quality.code().to_string()),
            ],
            &value.rendered(),
        );
        let first = !self
            .device_builders
            .get(&device_id)
            .is_some_and(|d| d.seen_first_data_item);
        let added = self.try_append(device_id, xml, first);
        if added {
            self.device_mut(device_id).seen_first_data_item = true;
        }
        added
    }

    /// Appends an alarm item.
    pub fn add_alarm(&mut self, device_id: DeviceId, name: &str, severity: u32, condition: &str, timestamp: &str) -> bool {
        let xml = render_empty(
            "Al",
            &[
                ("n", name.to_string()),
                ("s", severity.to_string()),
                ("c", condition.to_string()),
                ("t", timestamp.to_string()),
            ],
        );
        self.try_append(device_id, xml, false)
    }

    /// Appends an event item.
    pub fn add_event(&mut self, device_id: DeviceId, name: &str, message: &str, timestamp: &str) -> bool {
        let xml = render_empty("Ev", &[("n", name.to_string()), ("m", message.to_string()), ("t", timestamp.to_string())]);
        self.try_append(device_id, xml, false)
    }

    /// Appends a SOAP command status item (§4.8). Status codes are formatted in
    /// hex, not decimal, per the source's `CreateSOAPCommandStatus` (§10.8).
    pub fn add_soap_command_status(
        &mut self,
        device_id: DeviceId,
        command_id: &str,
        user_id: &str,
        status_code: u32,
        reason: &str,
        timestamp: &str,
    ) -> bool {
        let xml = render_empty(
            "Ps",
            &[
                ("cid", command_id.to_string()),
                ("uid", user_id.to_string()),
                ("sc", format!("{status_code:X}")),
                ("reason", reason.to_string()),
                ("t", timestamp.to_string()),
            ],
        );
        self.try_append(device_id, xml, false)
    }

    /// Appends a `<DAv>` desktop-application-announce item, posted once a local
    /// desktop viewer answers the remote-session probe (§4.11 "announces it to
    /// the server").
    pub fn add_desktop_app(&mut self, device_id: DeviceId, app_name: &str, version: u32, rfb_compatible: bool, platform: &str) -> bool {
        let xml = render_desktop_app_item(app_name, version, rfb_compatible, platform);
        self.try_append(device_id, xml, false)
    }

    /// Serializes the full envelope: root element, one `<De>` per touched
    /// device, each device's accumulated content in insertion order.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        let root_name = match self.kind {
            EMessageKind::Standard => "Ea",
            EMessageKind::Maintenance => "MT",
        };
        let mut root = BytesStart::new(root_name);
        root.push_attribute(("id", self.id.to_string().as_str()));
        if matches!(self.kind, EMessageKind::Standard) {
            root.push_attribute(("rc", "0"));
            root.push_attribute(("v", self.protocol_version));
        }
        writer.write_event(Event::Start(root)).unwrap();

        for device_id in &self.devices {
            let device = &self.device_builders[device_id];
            let mut de = BytesStart::new("De");
            de.push_attribute(("mn", device.mn.as_str()));
            de.push_attribute(("sn", device.sn.as_str()));
            de.push_attribute(("ow", device.ow.as_str()));
            writer.write_event(Event::Start(de)).unwrap();
            writer
                .get_mut()
                .get_mut()
                .extend_from_slice(&device.body);
            writer.write_event(Event::End(BytesEnd::new("De"))).unwrap();
        }
        writer.write_event(Event::End(BytesEnd::new(root_name))).unwrap();
        writer.into_inner().into_inner()
    }
}

/// Renders a standalone `<DAv>` item, for posting to the [`crate::queue::MessageQueue`]
/// as pre-rendered content (the remote-session desktop probe runs outside any
/// in-progress [`EMessageBuilder`], so it cannot append through `add_desktop_app`
/// directly — it queues this rendering instead, per [`crate::server_session::ServerSession::deliver_pending`]'s
/// "drain queued raw content" pattern).
#[must_use]
pub fn render_desktop_app_item(app_name: &str, version: u32, rfb_compatible: bool, platform: &str) -> Vec<u8> {
    render_empty(
        "DAv",
        &[
            ("n", app_name.to_string()),
            ("v", version.to_string()),
            ("rfb", u8::from(rfb_compatible).to_string()),
            ("p", platform.to_string()),
        ],
    )
}

fn render_empty(tag: &str, attrs: &[(&str, String)]) -> Vec<u8> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut start = BytesStart::new(tag);
    for (k, v) in attrs {
        start.push_attribute((*k, v.as_str()));
    }
    writer.write_event(Event::Empty(start)).unwrap();
    writer.into_inner().into_inner()
}

/// Renders `<tag attrs...>text</tag>`, entitizing `text` via `quick-xml`'s
/// writer rather than hand-rolled escaping.
fn render_char_data(tag: &str, attrs: &[(&str, String)], text: &str) -> Vec<u8> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut start = BytesStart::new(tag);
    for (k, v) in attrs {
        start.push_attribute((*k, v.as_str()));
    }
    writer.write_event(Event::Start(start)).unwrap();
    writer.write_event(Event::Text(BytesText::new(text))).unwrap();
    writer.write_event(Event::End(BytesEnd::new(tag))).unwrap();
    writer.into_inner().into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(n: u32) -> DeviceId {
        DeviceId::new(n)
    }

    #[test]
    fn renders_ping_inside_device_inside_root() {
        let mut builder = EMessageBuilder::new(EMessageKind::Standard, 1, EMessageByteBudget::try_new(4096).unwrap());
        builder.set_device_identity(dev(0), "model", "serial", "owner");
        assert!(builder.add_ping(dev(0), "systime"));
        let xml = String::from_utf8(builder.finish()).unwrap();
        assert!(xml.starts_with("<Ea id=\"1\" rc=\"0\" v=\"6.5\">"));
        assert!(xml.contains("<De mn=\"model\" sn=\"serial\" ow=\"owner\">"));
        assert!(xml.contains("<Pi t=\"systime\"/>"));
    }

    #[test]
    fn refuses_item_that_would_exceed_budget() {
        let mut builder = EMessageBuilder::new(EMessageKind::Standard, 1, EMessageByteBudget::try_new(10).unwrap());
        builder.set_device_identity(dev(0), "m", "s", "o");
        let added = builder.add_alarm(dev(0), "overheat", 5, "active", "2024-01-01T00:00:00.000Z");
        assert!(!added);
    }

    #[test]
    fn first_data_item_is_exempt_from_budget() {
        let mut builder = EMessageBuilder::new(EMessageKind::Standard, 1, EMessageByteBudget::try_new(1).unwrap());
        builder.set_device_identity(dev(0), "m", "s", "o");
        let reading = DataItemValue::Analog(Decimal::new(986, 1));
        assert!(builder.add_data(dev(0), "temp", &reading, DataItemQuality::Good, "2024-01-01T00:00:00.000Z"));
        let reading2 = DataItemValue::Analog(Decimal::new(987, 1));
        assert!(!builder.add_data(dev(0), "temp", &reading2, DataItemQuality::Good, "2024-01-01T00:00:01.000Z"));
    }

    #[test]
    fn analog_data_item_trims_trailing_zeros_and_carries_type_and_quality() {
        let mut builder = EMessageBuilder::new(EMessageKind::Standard, 1, EMessageByteBudget::try_new(4096).unwrap());
        builder.set_device_identity(dev(0), "m", "s", "o");
        let reading = DataItemValue::Analog(Decimal::new(986, 1)); // 98.6
        assert!(builder.add_data(dev(0), "temp", &reading, DataItemQuality::Good, "2024-01-01T00:00:00.000Z"));
        let xml = String::from_utf8(builder.finish()).unwrap();
        assert!(xml.contains("ty=\"a\""));
        assert!(xml.contains("q=\"g\""));
        assert!(xml.contains(">98.6<"));
    }

    #[test]
    fn digital_data_item_renders_as_zero_or_one() {
        let mut builder = EMessageBuilder::new(EMessageKind::Standard, 1, EMessageByteBudget::try_new(4096).unwrap());
        builder.set_device_identity(dev(0), "m", "s", "o");
        let value = DataItemValue::Digital(true);
        assert!(builder.add_data(dev(0), "door_open", &value, DataItemQuality::Uncertain, "systime"));
        let xml = String::from_utf8(builder.finish()).unwrap();
        assert!(xml.contains("ty=\"d\""));
        assert!(xml.contains("q=\"u\""));
        assert!(xml.contains(">1<"));
    }

    #[test]
    fn string_data_item_entitizes_reserved_characters() {
        let mut builder = EMessageBuilder::new(EMessageKind::Standard, 1, EMessageByteBudget::try_new(4096).unwrap());
        builder.set_device_identity(dev(0), "m", "s", "o");
        let value = DataItemValue::String("<ok> & \"done\"".to_string());
        assert!(builder.add_data(dev(0), "status", &value, DataItemQuality::Bad, "systime"));
        let xml = String::from_utf8(builder.finish()).unwrap();
        assert!(xml.contains("ty=\"s\""));
        assert!(xml.contains("q=\"b\""));
        assert!(!xml.contains("<ok>"));
        assert!(xml.contains("&lt;ok&gt;"));
    }

    #[test]
    fn managed_devices_emits_empty_cs_when_none_reported() {
        let mut builder = EMessageBuilder::new(EMessageKind::Maintenance, 2, EMessageByteBudget::try_new(4096).unwrap());
        builder.set_device_identity(dev(0), "m", "s", "o");
        assert!(builder.add_managed_devices(dev(0), &[]));
        let xml = String::from_utf8(builder.finish()).unwrap();
        assert!(xml.contains("<Md><Cs/></Md>"));
    }

    #[test]
    fn desktop_app_announce_reports_rfb_flag() {
        let mut builder = EMessageBuilder::new(EMessageKind::Standard, 1, EMessageByteBudget::try_new(4096).unwrap());
        builder.set_device_identity(dev(0), "m", "s", "o");
        assert!(builder.add_desktop_app(dev(0), "ServiceLink Viewer", 3, true, "linux-x86_64"));
        let xml = String::from_utf8(builder.finish()).unwrap();
        assert!(xml.contains("<DAv n=\"ServiceLink Viewer\" v=\"3\" rfb=\"1\" p=\"linux-x86_64\"/>"));
    }

    #[test]
    fn soap_status_code_is_hex_formatted() {
        let mut builder = EMessageBuilder::new(EMessageKind::Standard, 1, EMessageByteBudget::try_new(4096).unwrap());
        builder.set_device_identity(dev(0), "m", "s", "o");
        builder.add_soap_command_status(dev(0), "c1", "u1", 255, "ok", "systime");
        let xml = String::from_utf8(builder.finish()).unwrap();
        assert!(xml.contains("sc=\"FF\""));
    }

    #[test]
    fn timestamp_clamps_pre_epoch_to_zero() {
        let before_epoch = UNIX_EPOCH - std::time::Duration::from_secs(10);
        let ts = format_timestamp(before_epoch, ServerTimestampMode::Device);
        assert_eq!(ts, "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn server_timestamp_mode_substitutes_systime_literal() {
        let ts = format_timestamp(SystemTime::now(), ServerTimestampMode::Server);
        assert_eq!(ts, "systime");
    }

    #[test]
    fn known_epoch_formats_correctly() {
        let t = UNIX_EPOCH + std::time::Duration::from_millis(1_700_000_000_123);
        let ts = format_timestamp(t, ServerTimestampMode::Device);
        assert_eq!(ts, "2023-11-14T22:13:20.123Z");
    }
}
