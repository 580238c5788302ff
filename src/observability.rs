//! Logging initialization (§10.3).
//!
//! Every component logs through `tracing` spans/events directly; this module
//! owns only the one-time subscriber setup the binary entry point calls.

use crate::config::LogLevel;

/// Builds the `EnvFilter` directive string for `level`, honoring
/// `RUST_LOG` overrides the same way `EnvFilter::from_default_env()` would
/// layer on top of a crate-default directive (§6 "log-level", §10.3).
#[must_use]
pub fn directive_for(level: LogLevel) -> String {
    let level_str = match level {
        LogLevel::None => "off",
        LogLevel::Error => "error",
        LogLevel::Warning => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    };
    format!("axeda={level_str}")
}

/// Initializes the global `tracing` subscriber with an `axeda=info`-style
/// default directive, falling back to `RUST_LOG` when set (§10.3).
///
/// # Panics
/// Panics if a global subscriber has already been installed.
pub fn init(default_level: LogLevel) {
    let directive = directive_for(default_level);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_uses_off_for_none_level() {
        assert_eq!(directive_for(LogLevel::None), "axeda=off");
    }

    #[test]
    fn directive_uses_info_by_default() {
        assert_eq!(directive_for(LogLevel::Info), "axeda=info");
    }
}
