//! Destination Configuration
//!
//! Shape of one `[destinations.<name>]` block. Every key not listed here is
//! captured in `connection` and handed to the adapter constructor untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub const BATCH_MODE: &str = "batch";
pub const STREAM_MODE: &str = "stream";

/// Delivery strategy of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Buffer rows in memory and write them in groups
    Batch,
    /// Persist every row to a durable queue before delivery
    Stream,
}

impl DeliveryMode {
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            BATCH_MODE => Some(DeliveryMode::Batch),
            STREAM_MODE => Some(DeliveryMode::Stream),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Batch => BATCH_MODE,
            DeliveryMode::Stream => STREAM_MODE,
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of a single destination
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Ingestion tokens routed to this destination (empty = all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub only_tokens: Vec<String>,
    /// Destination type; defaults to the destination name
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub destination_type: Option<String>,
    /// `batch` or `stream`; defaults to `batch`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_layout: Option<DataLayout>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enrichment: Vec<EnrichmentRuleConfig>,
    #[serde(default)]
    pub break_on_error: bool,
    /// Adapter-specific blocks (`datasource`, `s3`, `clickhouse`, ...)
    #[serde(flatten)]
    pub connection: BTreeMap<String, Value>,
}

impl DestinationConfig {
    /// Whether events carrying `token` are routed here
    pub fn accepts_token(&self, token: &str) -> bool {
        self.only_tokens.is_empty() || self.only_tokens.iter().any(|t| t == token)
    }

    /// Adapter-specific block by key
    pub fn connection_block(&self, key: &str) -> Option<&Value> {
        self.connection.get(key)
    }
}

/// Table layout: field mapping, table name and primary key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataLayout {
    /// Mode for legacy string rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_type: Option<LegacyMappingType>,
    /// Legacy rules: `"/src -> /dst"` or `"/src -> "`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapping: Vec<String>,
    /// Structured rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mappings: Option<StructuredMappingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name_template: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key_fields: Vec<String>,
}

/// Handling of fields not named by legacy rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyMappingType {
    /// Keep unmapped fields
    #[default]
    Default,
    /// Keep only mapped fields
    Strict,
}

impl fmt::Display for LegacyMappingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegacyMappingType::Default => f.write_str("default"),
            LegacyMappingType::Strict => f.write_str("strict"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredMappingConfig {
    /// Defaults to true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_unmapped: Option<bool>,
    #[serde(default)]
    pub fields: Vec<MappingRuleConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingAction {
    Move,
    Remove,
    Cast,
    Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRuleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    pub action: MappingAction,
    /// SQL type cast for the destination column
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub sql_type: Option<String>,
    /// Value for `constant` rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl fmt::Display for MappingRuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "src: {} action: {:?} dst: {}",
            self.src.as_deref().unwrap_or("-"),
            self.action,
            self.dst.as_deref().unwrap_or("-"),
        )?;
        if let Some(t) = &self.sql_type {
            write!(f, " type: {}", t)?;
        }
        if let Some(v) = &self.value {
            write!(f, " value: {}", v)?;
        }
        Ok(())
    }
}

/// One configured enrichment rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentRuleConfig {
    pub name: String,
    pub from: String,
    pub to: String,
}

impl fmt::Display for EnrichmentRuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "name: {} from: {} to: {}", self.name, self.from, self.to)
    }
}
