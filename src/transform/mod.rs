//! Transform pipeline
//!
//! `MappingStep` turns a raw event into a row for one destination:
//! enrichment, field mapping, flattening, table name and primary key.

pub mod enrichment;
pub mod flatten;
pub mod mapping;
pub mod path;
pub mod table;
pub mod useragent;

pub use enrichment::{EnrichmentKind, EnrichmentRule, GeoResolver, NoopGeoResolver};
pub use mapping::FieldMapper;
pub use path::FieldPath;
pub use table::{TableNameTemplate, DEFAULT_TABLE_NAME};

use crate::event::{ProcessedRow, RawEvent};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Invalid transform configuration, found while building a destination
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("Error creating enrichment rule [{rule}]: {reason}")]
    Enrichment { rule: String, reason: String },

    #[error("invalid field mapping: {0}")]
    Mapping(String),

    #[error("invalid table name template '{template}': {reason}")]
    TableName { template: String, reason: String },
}

/// Per-event transform failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("enrichment rule [{rule}] failed: {reason}")]
    Enrichment { rule: String, reason: String },

    #[error("field mapping failed: {0}")]
    Mapping(String),

    #[error("table name template '{template}' rendered an empty name")]
    EmptyTableName { template: String },
}

/// Transform pipeline of one destination. Pure apart from logging.
pub struct MappingStep {
    destination: String,
    table: TableNameTemplate,
    mapper: FieldMapper,
    enrichment: Vec<EnrichmentRule>,
    primary_key_fields: Vec<String>,
    break_on_error: bool,
    geo: Arc<dyn GeoResolver>,
}

impl std::fmt::Debug for MappingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingStep")
            .field("destination", &self.destination)
            .field("table", &self.table.source())
            .field("mapper", &self.mapper.mode_description())
            .field("enrichment", &self.enrichment.len())
            .field("break_on_error", &self.break_on_error)
            .finish()
    }
}

impl MappingStep {
    pub fn new(
        destination: impl Into<String>,
        table: TableNameTemplate,
        mapper: FieldMapper,
        enrichment: Vec<EnrichmentRule>,
        primary_key_fields: Vec<String>,
        break_on_error: bool,
        geo: Arc<dyn GeoResolver>,
    ) -> Self {
        MappingStep {
            destination: destination.into(),
            table,
            mapper,
            enrichment,
            primary_key_fields,
            break_on_error,
            geo,
        }
    }

    pub fn break_on_error(&self) -> bool {
        self.break_on_error
    }

    pub fn primary_key_fields(&self) -> &[String] {
        &self.primary_key_fields
    }

    pub fn process(&self, event: &RawEvent) -> Result<ProcessedRow, TransformError> {
        let mut payload = event.payload().clone();

        for rule in &self.enrichment {
            if let Err(reason) = rule.apply(&mut payload, self.geo.as_ref()) {
                if self.break_on_error {
                    return Err(TransformError::Enrichment {
                        rule: rule.to_string(),
                        reason,
                    });
                }
                warn!(
                    destination = %self.destination,
                    event_id = %event.event_id(),
                    rule = %rule,
                    error = %reason,
                    "enrichment failed, continuing"
                );
            }
        }

        let mapped = self.mapper.map(&payload).map_err(TransformError::Mapping)?;

        let table = self.table.render(&mapped);
        if table.trim().is_empty() {
            return Err(TransformError::EmptyTableName {
                template: self.table.source().to_string(),
            });
        }

        let columns = flatten::flatten(&mapped);
        let primary_key = self
            .primary_key_fields
            .iter()
            .filter(|field| columns.contains_key(field.as_str()))
            .cloned()
            .collect();

        Ok(ProcessedRow::new(event.event_id(), table, columns, primary_key))
    }
}
