//! JSON data source.
//!
//! Accepts either a top-level array of objects or an object with a `rows` array. Each object
//! becomes one row; non-object entries are rejected with their position.

use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::path::Path;

use super::{DataSource, Row};

/// Source that reads rows from a JSON document.
#[derive(Debug, Clone, Default)]
pub struct JsonSource;

impl JsonSource {
    fn parse(&self, value: Value) -> Result<Vec<Row>> {
        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("rows") {
                Some(Value::Array(items)) => items,
                _ => bail!("JSON data must be an array of objects or an object with a `rows` array"),
            },
            _ => bail!("JSON data must be an array of objects or an object with a `rows` array"),
        };

        items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(map) => Ok(map.into_iter().collect::<Row>()),
                other => bail!("Row {} is not an object (found {})", i + 1, kind_of(&other)),
            })
            .collect()
    }
}

impl DataSource for JsonSource {
    fn name(&self) -> &'static str {
        "json"
    }

    fn load(&self, path: &Path) -> Result<Vec<Row>> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read data file {}", path.display()))?;
        let value: Value = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse JSON data from {}", path.display()))?;
        self.parse(value)
            .with_context(|| format!("Invalid JSON data in {}", path.display()))
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
