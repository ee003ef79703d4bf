//! Event Types
//!
//! `RawEvent` is what ingestion hands over; `ProcessedRow` is what a
//! destination adapter writes. Rows are serialisable so the durable queue
//! can persist them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Top-level field carrying the event identity
pub const EVENT_ID_FIELD: &str = "eventn_ctx_event_id";
/// Nested location of the event identity (`eventn_ctx.event_id`)
const EVENT_CTX_FIELD: &str = "eventn_ctx";
const EVENT_CTX_ID_FIELD: &str = "event_id";

/// Raw event as received from ingestion. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    event_id: String,
    token: String,
    payload: Map<String, Value>,
}

impl RawEvent {
    /// Wrap a JSON object. The event id is read from the payload when
    /// present, otherwise a random one is assigned.
    pub fn new(token: impl Into<String>, payload: Map<String, Value>) -> Self {
        let event_id = extract_event_id(&payload)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        RawEvent {
            event_id,
            token: token.into(),
            payload,
        }
    }

    /// Build from an arbitrary JSON value; non-object values are rejected.
    pub fn from_value(token: impl Into<String>, value: Value) -> Option<Self> {
        match value {
            Value::Object(payload) => Some(Self::new(token, payload)),
            _ => None,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Ingestion token identifying the event source
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }
}

fn extract_event_id(payload: &Map<String, Value>) -> Option<String> {
    let top = payload.get(EVENT_ID_FIELD).and_then(id_string);
    top.or_else(|| {
        payload
            .get(EVENT_CTX_FIELD)
            .and_then(Value::as_object)
            .and_then(|ctx| ctx.get(EVENT_CTX_ID_FIELD))
            .and_then(id_string)
    })
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Typed column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Arrays and other composite values stored as JSON text
    Json(String),
    /// Integers above `i64::MAX`
    UInt(u64),
}

impl ColumnValue {
    /// Convert a scalar JSON value. Objects are expected to be flattened
    /// before reaching this point and are kept as JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ColumnValue::Null,
            Value::Bool(b) => ColumnValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ColumnValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    ColumnValue::UInt(u)
                } else {
                    n.as_f64()
                        .map(ColumnValue::Float)
                        .unwrap_or_else(|| ColumnValue::Text(n.to_string()))
                }
            }
            Value::String(s) => ColumnValue::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => ColumnValue::Json(value.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ColumnValue::Null => Value::Null,
            ColumnValue::Bool(b) => Value::Bool(*b),
            ColumnValue::Int(i) => Value::from(*i),
            ColumnValue::UInt(u) => Value::from(*u),
            ColumnValue::Float(f) => Value::from(*f),
            ColumnValue::Text(s) => Value::String(s.clone()),
            ColumnValue::Json(s) => serde_json::from_str(s).unwrap_or(Value::String(s.clone())),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Row produced by the transform pipeline for one destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRow {
    pub event_id: String,
    /// Target table, never empty
    pub table: String,
    pub columns: BTreeMap<String, ColumnValue>,
    /// Primary key columns present in this row, in configuration order
    pub primary_key: Vec<String>,
}

impl ProcessedRow {
    pub fn new(
        event_id: impl Into<String>,
        table: impl Into<String>,
        columns: BTreeMap<String, ColumnValue>,
        primary_key: Vec<String>,
    ) -> Self {
        let table = table.into();
        debug_assert!(!table.is_empty(), "Precondition: table name must not be empty");
        ProcessedRow {
            event_id: event_id.into(),
            table,
            columns,
            primary_key,
        }
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.columns.get(column)
    }

    /// Row as a flat JSON object (used by JSON-lines adapters)
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .columns
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Value::Object(map)
    }
}
