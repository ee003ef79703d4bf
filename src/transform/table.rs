//! Table name templates: literals with `{{.path.to.field}}` placeholders.

use super::RuleError;
use serde_json::{Map, Value};

pub const DEFAULT_TABLE_NAME: &str = "events";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Field(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNameTemplate {
    source: String,
    parts: Vec<Part>,
}

impl Default for TableNameTemplate {
    fn default() -> Self {
        TableNameTemplate {
            source: DEFAULT_TABLE_NAME.to_string(),
            parts: vec![Part::Literal(DEFAULT_TABLE_NAME.to_string())],
        }
    }
}

impl TableNameTemplate {
    pub fn parse(template: &str) -> Result<Self, RuleError> {
        let invalid = |reason: &str| RuleError::TableName {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = Vec::new();
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            if start > 0 {
                parts.push(Part::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| invalid("unterminated '{{'"))?;
            let expr = after[..end].trim();
            let path = expr
                .strip_prefix('.')
                .ok_or_else(|| invalid("placeholder must look like {{.field}}"))?;
            let segments: Vec<String> = path.split('.').map(str::to_string).collect();
            if segments.iter().any(|s| s.is_empty()) {
                return Err(invalid("placeholder has an empty field name"));
            }
            parts.push(Part::Field(segments));
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        if parts.is_empty() {
            return Err(invalid("template is empty"));
        }

        Ok(TableNameTemplate {
            source: template.to_string(),
            parts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_literal(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Literal(_)))
    }

    /// Render against an event. Missing or null fields render as nothing.
    pub fn render(&self, event: &Map<String, Value>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Field(segments) => {
                    if let Some(value) = lookup(event, segments) {
                        match value {
                            Value::Null => {}
                            Value::String(s) => out.push_str(s),
                            other => out.push_str(&other.to_string()),
                        }
                    }
                }
            }
        }
        out
    }
}

fn lookup<'a>(event: &'a Map<String, Value>, segments: &[String]) -> Option<&'a Value> {
    let (last, parents) = segments.split_last()?;
    let mut current = event;
    for segment in parents {
        current = current.get(segment)?.as_object()?;
    }
    current.get(last)
}
