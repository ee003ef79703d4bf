//! Flatten a nested event into typed columns.
//!
//! Nested object keys are joined with `_`; arrays are kept as JSON text.

use crate::event::ColumnValue;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const SEPARATOR: char = '_';

pub fn flatten(event: &Map<String, Value>) -> BTreeMap<String, ColumnValue> {
    let mut columns = BTreeMap::new();
    flatten_into(&mut columns, None, event);
    columns
}

fn flatten_into(columns: &mut BTreeMap<String, ColumnValue>, prefix: Option<&str>, object: &Map<String, Value>) {
    for (key, value) in object {
        let column = match prefix {
            Some(prefix) => format!("{}{}{}", prefix, SEPARATOR, key),
            None => key.clone(),
        };
        match value {
            Value::Object(nested) => flatten_into(columns, Some(&column), nested),
            other => {
                columns.insert(column, ColumnValue::from_json(other));
            }
        }
    }
}
