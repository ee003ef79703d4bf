//! Slash-separated field paths (`/eventn_ctx/user_agent`).

use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse `/a/b`. The path must start with `/` and have no empty segment.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.trim().strip_prefix('/')?;
        if rest.is_empty() {
            return None;
        }
        let segments: Vec<String> = rest.split('/').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(FieldPath { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Column name after flattening (`/a/b` becomes `a_b`)
    pub fn flattened(&self) -> String {
        self.segments.join("_")
    }

    pub fn get<'a>(&self, object: &'a Map<String, Value>) -> Option<&'a Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut current = object;
        for segment in parents {
            current = current.get(segment)?.as_object()?;
        }
        current.get(last)
    }

    /// Set a value, creating intermediate objects. Fails when a parent
    /// exists but is not an object.
    pub fn set(&self, object: &mut Map<String, Value>, value: Value) -> Result<(), String> {
        let Some((last, parents)) = self.segments.split_last() else {
            return Err("empty path".to_string());
        };
        let mut current = object;
        for segment in parents {
            let next = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            current = match next {
                Value::Object(map) => map,
                other => {
                    return Err(format!(
                        "cannot set {}: parent {} is a {}",
                        self,
                        segment,
                        json_kind(other)
                    ))
                }
            };
        }
        current.insert(last.clone(), value);
        Ok(())
    }

    pub fn remove(&self, object: &mut Map<String, Value>) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut current = object;
        for segment in parents {
            current = current.get_mut(segment)?.as_object_mut()?;
        }
        current.remove(last)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
