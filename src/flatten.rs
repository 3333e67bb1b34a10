//! Flattening of nested records into single-level records.
//!
//! Nested object keys are joined with `_` so that every value can be typed as a
//! column on its own. Arrays are kept whole as their JSON text.

use anyhow::{Context, Result, bail};
use serde_json::Value;

use crate::data::{Record, normalize_field_name};

const UNNAMED_KEY: &str = "_unnamed";

pub trait Flattener: Send + Sync {
    fn flatten(&self, object: &Record) -> Result<Record>;
}

#[derive(Debug, Clone)]
pub struct JsonFlattener {
    separator: String,
    omit_nil_values: bool,
}

impl Default for JsonFlattener {
    fn default() -> Self {
        JsonFlattener {
            separator: "_".to_string(),
            omit_nil_values: true,
        }
    }
}

impl JsonFlattener {
    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn keep_nil_values(mut self) -> Self {
        self.omit_nil_values = false;
        self
    }

    fn flatten_into(&self, key: &str, value: &Value, destination: &mut Record) -> Result<()> {
        match value {
            Value::Object(nested) => {
                for (child, child_value) in nested {
                    let child_key = if key.is_empty() {
                        normalize_field_name(child)
                    } else {
                        format!("{key}{}{}", self.separator, normalize_field_name(child))
                    };
                    self.flatten_into(&child_key, child_value, destination)?;
                }
                Ok(())
            }
            Value::Array(_) => {
                let serialized = serde_json::to_string(value)
                    .with_context(|| format!("Serializing array field [{key}]"))?;
                insert_unique(destination, key, Value::String(serialized))
            }
            Value::Null if self.omit_nil_values => Ok(()),
            scalar => insert_unique(destination, key, scalar.clone()),
        }
    }
}

impl Flattener for JsonFlattener {
    fn flatten(&self, object: &Record) -> Result<Record> {
        let mut flat = Record::new();
        for (key, value) in object {
            let top_key = match normalize_field_name(key) {
                normalized if normalized.is_empty() => UNNAMED_KEY.to_string(),
                normalized => normalized,
            };
            self.flatten_into(&top_key, value, &mut flat)?;
        }
        Ok(flat)
    }
}

fn insert_unique(destination: &mut Record, key: &str, value: Value) -> Result<()> {
    if destination.contains_key(key) {
        bail!("more than one field flattens to [{key}]");
    }
    destination.insert(key.to_string(), value);
    Ok(())
}
