//! Configuration
//!
//! Destination blocks, delivery tunables and the service file that ties them
//! together.

pub mod delivery;
pub mod destination;
pub mod duration;
pub mod service;

pub use delivery::{BatchConfig, DeliveryConfig, StreamConfig};
pub use destination::{
    DataLayout, DeliveryMode, DestinationConfig, EnrichmentRuleConfig, LegacyMappingType,
    MappingAction, MappingRuleConfig, StructuredMappingConfig, BATCH_MODE, STREAM_MODE,
};
pub use service::ServiceConfig;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid delivery setting {key}: {reason}")]
    Invalid { key: &'static str, reason: &'static str },
}
