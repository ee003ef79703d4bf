//! Logging Configuration
//!
//! All settings are loaded from environment variables.

/// Output format of log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single lines
    Compact,
    /// One JSON object per line
    Json,
}

/// Logging configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter used when RUST_LOG is unset (default: info)
    pub default_level: String,
    /// EVENT_RELAY_LOG_FORMAT: `json` or `compact` (default: compact)
    pub format: LogFormat,
    /// EVENT_RELAY_LOG_TARGETS: include module targets (default: true)
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            default_level: "info".to_string(),
            format: LogFormat::Compact,
            with_target: true,
        }
    }
}

impl LogConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = LogConfig::default();
        LogConfig {
            default_level: lookup("EVENT_RELAY_LOG_LEVEL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.default_level),
            format: match lookup("EVENT_RELAY_LOG_FORMAT").as_deref().map(str::trim) {
                Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => defaults.format,
            },
            with_target: lookup("EVENT_RELAY_LOG_TARGETS")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.with_target),
        }
    }
}
