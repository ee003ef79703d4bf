//! Service configuration
//!
//! Loaded from a TOML file, then overridden from environment variables:
//!
//! | Variable | Description |
//! |----------|-------------|
//! | EVENT_RELAY_LOG_EVENT_PATH | Directory for durable queue files |
//! | EVENT_RELAY_OUTCOME_CAPACITY | Outcomes kept per destination |
//! | EVENT_RELAY_MAX_QUEUE_BYTES | Disk limit per destination queue |

use super::{ConfigError, DeliveryConfig, DestinationConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const DEFAULT_LOG_EVENT_PATH: &str = "/tmp/event-relay/events";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory holding one queue per stream destination
    #[serde(default = "default_log_event_path")]
    pub log_event_path: PathBuf,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationConfig>,
}

fn default_log_event_path() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_EVENT_PATH)
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            log_event_path: default_log_event_path(),
            delivery: DeliveryConfig::default(),
            destinations: BTreeMap::new(),
        }
    }
}

impl ServiceConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Apply `EVENT_RELAY_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("EVENT_RELAY_LOG_EVENT_PATH") {
            self.log_event_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("EVENT_RELAY_OUTCOME_CAPACITY") {
            self.delivery.outcome_cache_capacity = parse_env("EVENT_RELAY_OUTCOME_CAPACITY", &raw)?;
        }
        if let Some(raw) = lookup("EVENT_RELAY_MAX_QUEUE_BYTES") {
            self.delivery.queue.max_disk_bytes = parse_env("EVENT_RELAY_MAX_QUEUE_BYTES", &raw)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
        log_event_path = "/var/lib/relay"

        [delivery]
        outcome_cache_capacity = 10

        [destinations.pg]
        type = "postgres"
        mode = "stream"
        only_tokens = ["js"]

        [destinations.pg.datasource]
        host = "db"

        [destinations.pg.data_layout]
        table_name_template = "{{.event_type}}"
        primary_key_fields = ["eventn_ctx_event_id"]

        [[destinations.pg.enrichment]]
        name = "user_agent_parse"
        from = "/ua"
        to = "/parsed"

        [destinations.archive]
        mode = "batch"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = ServiceConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.log_event_path, PathBuf::from("/var/lib/relay"));
        assert_eq!(config.delivery.outcome_cache_capacity, 10);
        assert_eq!(config.destinations.len(), 2);

        let pg = &config.destinations["pg"];
        assert_eq!(pg.mode.as_deref(), Some("stream"));
        assert_eq!(pg.connection_block("datasource").unwrap()["host"], "db");
        assert_eq!(pg.enrichment.len(), 1);
        assert!(config.destinations["archive"].destination_type.is_none());
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = ServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServiceConfig::default();
        let vars: HashMap<&str, &str> = [
            ("EVENT_RELAY_LOG_EVENT_PATH", "/data/q"),
            ("EVENT_RELAY_OUTCOME_CAPACITY", "7"),
        ]
        .into_iter()
        .collect();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.log_event_path, PathBuf::from("/data/q"));
        assert_eq!(config.delivery.outcome_cache_capacity, 7);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = ServiceConfig::default();
        let err = config
            .apply_overrides(|k| (k == "EVENT_RELAY_MAX_QUEUE_BYTES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("EVENT_RELAY_MAX_QUEUE_BYTES"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = ServiceConfig::from_file(&path).unwrap();
        assert_eq!(config.destinations.len(), 2);

        let missing = ServiceConfig::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
