//! Destinations
//!
//! The adapter contract, the built-in adapters, destination locks, and the
//! registry and service that turn configuration into running proxies.

pub mod adapter;
pub mod file;
pub mod lock;
pub mod log;
pub mod registry;
pub mod service;

pub use adapter::{AdapterContext, AdapterError, AdapterFuture, DestinationAdapter, ErrorClass};
pub use file::{FileAdapter, FILE_TYPE};
pub use lock::{
    DestinationLock, InProcessMonitorKeeper, LockError, LockFuture, MonitorKeeper,
    NoopMonitorKeeper,
};
pub use log::{LogAdapter, LOG_TYPE};
pub use registry::{AdapterConstructor, CreateDeps, DestinationRegistry};
pub use service::DestinationService;

use crate::config::ConfigError;
use crate::queue::QueueError;
use crate::transform::RuleError;
use thiserror::Error;

/// Destination construction failure
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Unknown destination mode: {0}. Available mode: [batch, stream]")]
    UnknownMode(String),

    #[error("Unknown destination type: {destination_type} (destination [{destination}])")]
    UnknownType {
        destination: String,
        destination_type: String,
    },

    #[error("{0}")]
    Enrichment(String),

    #[error("{0}")]
    Mapping(String),

    #[error("{0}")]
    TableName(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open queue: {0}")]
    Queue(#[from] QueueError),

    #[error("failed to create adapter for [{destination}]: {source}")]
    Adapter {
        destination: String,
        #[source]
        source: AdapterError,
    },
}

impl From<RuleError> for SetupError {
    fn from(e: RuleError) -> Self {
        let message = e.to_string();
        match e {
            RuleError::Enrichment { .. } => SetupError::Enrichment(message),
            RuleError::Mapping(_) => SetupError::Mapping(message),
            RuleError::TableName { .. } => SetupError::TableName(message),
        }
    }
}
