//! Agent configuration.
//!
//! Mirrors the preset-constructor / builder / `validate()` shape used throughout the
//! corpus for subsystem configuration (grounded on `message_router/config.rs`'s
//! `RouterConfig`): a flat, serializable struct with `development()`/`production()`/
//! `testing()` presets, a fluent builder, cross-field validation, and JSON file
//! round-tripping (§10.4).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain_types::{ChunkSize, PingIntervalMs, QueueByteBudget, RetryCount, RetryDelayMs};

/// Verbosity of the crate's `tracing` output, mapped onto an `EnvFilter` directive
/// at startup (§6 "log-level", §10.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogLevel {
    /// No logging at all.
    None,
    /// Errors only.
    Error,
    /// Errors and warnings.
    Warning,
    /// Errors, warnings, and informational events.
    #[default]
    Info,
    /// Everything, including per-byte protocol tracing.
    Debug,
}

impl LogLevel {
    /// Renders as the `tracing_subscriber::EnvFilter` directive string for this crate.
    #[must_use]
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::None => "axeda_agent=off",
            LogLevel::Error => "axeda_agent=error",
            LogLevel::Warning => "axeda_agent=warn",
            LogLevel::Info => "axeda_agent=info",
            LogLevel::Debug => "axeda_agent=debug",
        }
    }
}

/// Which clock supplies EMessage timestamps (§4.6, §10.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServerTimestampMode {
    /// Timestamp locally using the device clock.
    #[default]
    Device,
    /// Emit the literal token `systime`; the server substitutes its own clock on receipt.
    Server,
}

/// Minimum acceptable TLS security level (§6 "SSL").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CryptoLevel {
    /// No TLS.
    None,
    /// Accept weak/legacy cipher suites.
    Low,
    /// Default: modern cipher suites only.
    #[default]
    Medium,
    /// Reject any cipher suite not on an explicit allow-list.
    High,
}

/// Outbound proxy configuration (§6 "proxy").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    /// Proxy protocol to use.
    pub protocol: ProxyProtocol,
    /// Proxy host name or address.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Username for proxy authentication, if required.
    pub user: Option<String>,
    /// Password for proxy authentication, if required.
    pub password: Option<String>,
}

/// Which proxy protocol to speak (§4.1, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProxyProtocol {
    /// No proxy; connect directly.
    #[default]
    None,
    /// HTTP CONNECT / absolute-URI proxying.
    Http,
    /// SOCKSv5, falling back to SOCKSv4 (§4.1, §9 Open Questions).
    Socks,
}

/// TLS configuration (§6 "SSL").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    /// Minimum acceptable cipher strength.
    pub crypto_level: CryptoLevel,
    /// Whether to validate the server's certificate chain and hostname.
    pub server_auth: bool,
    /// Optional path to a PEM file of trusted CA certificates; system roots if `None`.
    pub ca_cert_file: Option<PathBuf>,
}

/// HTTP transport configuration (§6 "HTTP").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// HTTP version to request ("1.0" or "1.1").
    pub version: String,
    /// Whether connections should be kept alive and reused.
    pub persistent: bool,
    /// Per-request timeout, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            version: "1.1".to_string(),
            persistent: true,
            timeout_ms: 30_000,
        }
    }
}

/// Top-level agent configuration (§6 "Configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Logging verbosity.
    pub log_level: LogLevel,
    /// Total byte budget for the outbound [`crate::queue::MessageQueue`] (§4.5).
    pub queue_byte_budget: QueueByteBudget,
    /// Maximum size of a single assembled EMessage (§4.6).
    pub emessage_byte_budget: crate::domain_types::EMessageByteBudget,
    /// Delay before retrying a failed server-session round (§4.7).
    pub retry_period_ms: u64,
    /// How EMessage timestamps are produced.
    pub server_timestamp_mode: ServerTimestampMode,
    /// Whether the event loop yields (sleeps briefly) when there is no pending I/O.
    pub yield_on_idle: bool,
    /// Outbound proxy, if any.
    pub proxy: ProxyConfig,
    /// TLS settings.
    pub tls: TlsConfig,
    /// HTTP transport settings.
    pub http: HttpConfig,
    /// Whether the device reports itself online in registration/ping messages.
    pub device_online: bool,
    /// Ping interval for server sessions (§4.7, §4.11).
    pub ping_interval: PingIntervalMs,
    /// Default chunk size for file-transfer instructions (§4.10).
    pub default_chunk_size: ChunkSize,
    /// Default retry count for file-transfer instructions (§4.10).
    pub default_retry_count: RetryCount,
    /// Minimum back-off delay between file-transfer chunk retries (§4.10).
    pub retry_min_delay: RetryDelayMs,
    /// Maximum back-off delay between file-transfer chunk retries (§4.10).
    pub retry_max_delay: RetryDelayMs,
    /// Number of worker tasks driving `process()` ticks for C7/C9/C11 (§5, §10.6).
    pub worker_threads: usize,
}

/// Failures raised while constructing or loading an [`AgentConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A cross-field validation rule was violated.
    #[error("invalid configuration: {field}: {reason}")]
    ValidationError {
        /// The field (or field pair) that failed validation.
        field: &'static str,
        /// Human-readable explanation.
        reason: String,
    },
    /// Reading or writing the configuration file failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    /// The configuration file was not valid JSON, or did not match the schema.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl AgentConfig {
    /// A configuration tuned for local development: verbose logging, short
    /// timeouts, small byte budgets so tests exercise overflow paths quickly.
    #[must_use]
    pub fn development() -> Self {
        Self {
            log_level: LogLevel::Debug,
            queue_byte_budget: QueueByteBudget::try_new(65_536).expect("valid default"),
            emessage_byte_budget: crate::domain_types::EMessageByteBudget::try_new(16_384)
                .expect("valid default"),
            retry_period_ms: 5_000,
            server_timestamp_mode: ServerTimestampMode::Device,
            yield_on_idle: true,
            proxy: ProxyConfig::default(),
            tls: TlsConfig {
                crypto_level: CryptoLevel::Medium,
                server_auth: true,
                ca_cert_file: None,
            },
            http: HttpConfig::default(),
            device_online: true,
            ping_interval: PingIntervalMs::new(10_000),
            default_chunk_size: ChunkSize::try_new(65_536).expect("valid default"),
            default_retry_count: RetryCount::try_new(3).expect("valid default"),
            retry_min_delay: RetryDelayMs::new(1_000),
            retry_max_delay: RetryDelayMs::new(30_000),
            worker_threads: 1,
        }
    }

    /// A configuration tuned for production deployment: quieter logging, larger
    /// byte budgets, longer retry back-off ceilings.
    #[must_use]
    pub fn production() -> Self {
        Self {
            log_level: LogLevel::Warning,
            queue_byte_budget: QueueByteBudget::try_new(1_048_576).expect("valid default"),
            emessage_byte_budget: crate::domain_types::EMessageByteBudget::try_new(131_072)
                .expect("valid default"),
            retry_period_ms: 60_000,
            server_timestamp_mode: ServerTimestampMode::Device,
            yield_on_idle: true,
            proxy: ProxyConfig::default(),
            tls: TlsConfig {
                crypto_level: CryptoLevel::High,
                server_auth: true,
                ca_cert_file: None,
            },
            http: HttpConfig::default(),
            device_online: true,
            ping_interval: PingIntervalMs::new(60_000),
            default_chunk_size: ChunkSize::try_new(65_536).expect("valid default"),
            default_retry_count: RetryCount::try_new(5).expect("valid default"),
            retry_min_delay: RetryDelayMs::new(2_000),
            retry_max_delay: RetryDelayMs::new(300_000),
            worker_threads: num_cpus::get().clamp(1, 4),
        }
    }

    /// A configuration tuned for automated tests: tiny budgets and timeouts so
    /// boundary conditions (§8) are reachable without waiting.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            log_level: LogLevel::Debug,
            queue_byte_budget: QueueByteBudget::try_new(4_096).expect("valid default"),
            emessage_byte_budget: crate::domain_types::EMessageByteBudget::try_new(1_024)
                .expect("valid default"),
            retry_period_ms: 100,
            server_timestamp_mode: ServerTimestampMode::Device,
            yield_on_idle: false,
            proxy: ProxyConfig::default(),
            tls: TlsConfig {
                crypto_level: CryptoLevel::Low,
                server_auth: false,
                ca_cert_file: None,
            },
            http: HttpConfig {
                version: "1.1".to_string(),
                persistent: true,
                timeout_ms: 1_000,
            },
            device_online: true,
            ping_interval: PingIntervalMs::new(100),
            default_chunk_size: ChunkSize::try_new(256).expect("valid default"),
            default_retry_count: RetryCount::try_new(2).expect("valid default"),
            retry_min_delay: RetryDelayMs::new(10),
            retry_max_delay: RetryDelayMs::new(50),
            worker_threads: 1,
        }
    }

    /// Cross-field validation beyond what individual `nutype` fields already enforce.
    ///
    /// # Errors
    /// Returns [`ConfigError::ValidationError`] describing the first rule violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.emessage_byte_budget.as_usize() > self.queue_byte_budget.as_usize() {
            return Err(ConfigError::ValidationError {
                field: "emessage_byte_budget",
                reason: "must not exceed queue_byte_budget".to_string(),
            });
        }
        if self.retry_min_delay.as_duration() >= self.retry_max_delay.as_duration() {
            return Err(ConfigError::ValidationError {
                field: "retry_min_delay/retry_max_delay",
                reason: "retry_min_delay must be strictly less than retry_max_delay".to_string(),
            });
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::ValidationError {
                field: "worker_threads",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.worker_threads > num_cpus::get() * 2 {
            return Err(ConfigError::ValidationError {
                field: "worker_threads",
                reason: format!(
                    "{} exceeds twice the available CPUs ({})",
                    self.worker_threads,
                    num_cpus::get()
                ),
            });
        }
        if matches!(self.proxy.protocol, ProxyProtocol::Http | ProxyProtocol::Socks)
            && self.proxy.host.is_empty()
        {
            return Err(ConfigError::ValidationError {
                field: "proxy.host",
                reason: "must be set when a proxy protocol is selected".to_string(),
            });
        }
        if self.http.version != "1.0" && self.http.version != "1.1" {
            return Err(ConfigError::ValidationError {
                field: "http.version",
                reason: "must be \"1.0\" or \"1.1\"".to_string(),
            });
        }
        Ok(())
    }

    /// Starts a fluent builder seeded from [`AgentConfig::development`].
    #[must_use]
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder {
            config: Self::development(),
        }
    }

    /// Serializes this configuration as pretty JSON and writes it to `path`.
    ///
    /// # Errors
    /// Returns [`ConfigError::IoError`] or [`ConfigError::SerializationError`].
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reads and validates a configuration previously written by [`AgentConfig::save_to_file`].
    ///
    /// # Errors
    /// Returns [`ConfigError::IoError`], [`ConfigError::SerializationError`], or a
    /// [`ConfigError::ValidationError`] if the loaded configuration is internally inconsistent.
    pub fn load_from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::development()
    }
}

/// Fluent builder over [`AgentConfig`], mirroring `RouterConfigBuilder`.
#[derive(Debug, Clone)]
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    /// Sets the logging verbosity.
    #[must_use]
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Sets the outbound queue's byte budget.
    #[must_use]
    pub fn queue_byte_budget(mut self, budget: QueueByteBudget) -> Self {
        self.config.queue_byte_budget = budget;
        self
    }

    /// Sets the per-EMessage byte budget.
    #[must_use]
    pub fn emessage_byte_budget(mut self, budget: crate::domain_types::EMessageByteBudget) -> Self {
        self.config.emessage_byte_budget = budget;
        self
    }

    /// Sets the proxy configuration.
    #[must_use]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = proxy;
        self
    }

    /// Sets the TLS configuration.
    #[must_use]
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = tls;
        self
    }

    /// Sets the number of worker tasks driving periodic `process()` ticks.
    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.config.worker_threads = count;
        self
    }

    /// Validates and returns the built configuration.
    ///
    /// # Errors
    /// Returns [`ConfigError::ValidationError`] if the accumulated settings are inconsistent.
    pub fn build(self) -> Result<AgentConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_preset_is_valid() {
        AgentConfig::development().validate().unwrap();
    }

    #[test]
    fn production_preset_is_valid() {
        AgentConfig::production().validate().unwrap();
    }

    #[test]
    fn testing_preset_is_valid() {
        AgentConfig::testing().validate().unwrap();
    }

    #[test]
    fn builder_produces_valid_config() {
        let config = AgentConfig::builder()
            .log_level(LogLevel::Debug)
            .worker_threads(1)
            .build()
            .unwrap();
        assert_eq!(config.worker_threads, 1);
    }

    #[test]
    fn rejects_emessage_budget_larger_than_queue_budget() {
        let mut config = AgentConfig::testing();
        config.emessage_byte_budget =
            crate::domain_types::EMessageByteBudget::try_new(10_000_000).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { field: "emessage_byte_budget", .. }));
    }

    #[test]
    fn rejects_inverted_retry_delays() {
        let mut config = AgentConfig::testing();
        config.retry_min_delay = RetryDelayMs::new(1000);
        config.retry_max_delay = RetryDelayMs::new(500);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_worker_threads() {
        let mut config = AgentConfig::testing();
        config.worker_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-config.json");
        let original = AgentConfig::testing();
        original.save_to_file(&path).unwrap();
        let loaded = AgentConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.retry_period_ms, original.retry_period_ms);
        assert_eq!(loaded.worker_threads, original.worker_threads);
    }
}
