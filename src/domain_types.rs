//! Domain types for the agent runtime.
//!
//! Every bounded or validated primitive used across the crate is wrapped in a
//! `nutype`-generated newtype rather than checked ad hoc at each call site (§10.1).

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Identifies a managed device within an EMessage (§3 "Outbound queue item").
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into,
    Default
))]
pub struct DeviceId(u32);

/// Identifies one of the (primary / backup / additional) server configurations
/// a [`crate::server_session::ServerSession`] is bound to.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into,
    Default
))]
pub struct ServerConfigId(u32);

/// Opaque identifier assigned to an outbound EMessage so queue items can be
/// deleted by `(message_id, device_id)` once delivery succeeds (§4.5).
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a new, process-unique message id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifies a file-transfer package (job) as assigned by the server (§3 "File-transfer package").
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct JobId(u64);

/// Identifies a logical channel multiplexed inside a remote session (§4.11).
///
/// Bounded to the wire protocol's 256-channel limit.
#[nutype(
    validate(less_or_equal = 255),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct ChannelId(u16);

/// Relative importance of a queued item or file-transfer package (§3, §4.5, §10.8).
///
/// Ordered `Low < Normal < High < Urgent`; a package's priority is the maximum of
/// its instructions' priorities, recomputed on every instruction addition (§10.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    /// Background telemetry; drained only when nothing higher is pending.
    Low,
    /// Default priority for ordinary data/alarm/event items.
    #[default]
    Normal,
    /// Elevated priority; preempts an in-flight `Normal`/`Low` package.
    High,
    /// Highest priority; always preempts lower-priority work.
    Urgent,
}

/// Upper bound, in bytes, on the total size of items held in a [`crate::queue::MessageQueue`] (§4.5).
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 65536
)]
pub struct QueueByteBudget(usize);

impl QueueByteBudget {
    /// Returns the budget as a plain byte count.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Upper bound, in bytes, on a single assembled EMessage (§4.6).
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 32768
)]
pub struct EMessageByteBudget(usize);

impl EMessageByteBudget {
    /// Returns the budget as a plain byte count.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Number of retry attempts a file-transfer instruction will make before giving up (§4.10).
#[nutype(
    validate(greater = 0, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct RetryCount(u32);

impl RetryCount {
    /// Returns the count as `u32`.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Milliseconds to wait before the first retry of a failed transfer chunk (§4.10).
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Default,
    TryFrom,
    Into
))]
pub struct RetryDelayMs(u64);

impl RetryDelayMs {
    /// Returns the delay as a [`Duration`].
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Size, in bytes, of a single file-transfer chunk (§4.10, §6).
#[nutype(
    validate(greater = 0, less_or_equal = 1_048_576),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 65536
)]
pub struct ChunkSize(usize);

impl ChunkSize {
    /// Returns the chunk size as a plain byte count.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// TCP port the desktop-probe handshake connects to before remote-session transport
/// selection (§4.11: fixed at 8331 by the wire protocol).
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default))]
pub struct ProbePort(u16);

impl Default for ProbePort {
    fn default() -> Self {
        Self::new(8331)
    }
}

/// Maximum number of channels a single remote session may multiplex (§4.11: fixed at 256).
pub const MAX_REMOTE_SESSION_CHANNELS: usize = 256;

/// Interval, in milliseconds, between `Ping` commands on an idle remote session (§4.11: 10s).
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default, Into))]
pub struct PingIntervalMs(u64);

impl Default for PingIntervalMs {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl PingIntervalMs {
    /// Returns the interval as a [`Duration`].
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// How long a remote session may run before it is force-stopped (§5 "Cancellation and timeouts").
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default, Into))]
pub struct SessionTimeoutMs(u64);

impl SessionTimeoutMs {
    /// Returns the timeout as a [`Duration`].
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Validation failures raised when constructing a domain type from untrusted input.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A named field failed its validation predicate.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },
    /// A numeric field fell outside its allowed range.
    #[error("value {value} out of range [{min}, {max}]")]
    ValueOutOfRange {
        /// The offending value, formatted.
        value: String,
        /// Minimum allowed value, formatted.
        min: String,
        /// Maximum allowed value, formatted.
        max: String,
    },
    /// A required field was missing entirely.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}
