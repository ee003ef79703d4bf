//! Destination adapter contract
//!
//! An adapter writes already-transformed rows to one external system. The
//! delivery layer owns batching, retries and outcomes; adapters only report
//! how a failed write should be treated.

use crate::config::{DeliveryMode, DestinationConfig};
use crate::event::ProcessedRow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use thiserror::Error;

/// How a failed write should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: retry with backoff
    Retryable,
    /// The rows can never be written: stop retrying
    Permanent,
    /// The adapter could not tell; retried within the capped budget
    Unclassified,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Retryable => "retryable",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unclassified => "unclassified",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class} adapter error: {message}")]
pub struct AdapterError {
    pub class: ErrorClass,
    pub message: String,
}

impl AdapterError {
    pub fn retryable(message: impl Into<String>) -> Self {
        AdapterError {
            class: ErrorClass::Retryable,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        AdapterError {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn unclassified(message: impl Into<String>) -> Self {
        AdapterError {
            class: ErrorClass::Unclassified,
            message: message.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.class == ErrorClass::Permanent
    }
}

impl From<io::Error> for AdapterError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::PermissionDenied
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::InvalidData => AdapterError::permanent(e.to_string()),
            io::ErrorKind::Other => AdapterError::unclassified(e.to_string()),
            _ => AdapterError::retryable(e.to_string()),
        }
    }
}

pub type AdapterFuture<'a> = Pin<Box<dyn Future<Output = Result<(), AdapterError>> + Send + 'a>>;

/// Writes rows to one destination.
///
/// Each call receives rows of a single batch (batch mode) or micro-batch
/// (stream mode). A call must either write every row or fail as a whole.
pub trait DestinationAdapter: Send + Sync + 'static {
    /// Type identifier, e.g. `file` or `postgres`
    fn type_name(&self) -> &str;

    fn write<'a>(&'a self, rows: &'a [ProcessedRow]) -> AdapterFuture<'a>;

    /// Release connections. Called once when the destination closes.
    fn close<'a>(&'a self) -> AdapterFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

/// Everything a constructor needs to build an adapter
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub name: String,
    pub destination_type: String,
    pub mode: DeliveryMode,
    pub config: DestinationConfig,
    pub primary_key_fields: BTreeSet<String>,
    /// SQL column types requested by structured mapping rules
    pub sql_type_casts: BTreeMap<String, String>,
}

impl AdapterContext {
    /// Adapter-specific block named after the destination type
    pub fn connection_block(&self) -> Option<&serde_json::Value> {
        self.config.connection_block(&self.destination_type)
    }
}
