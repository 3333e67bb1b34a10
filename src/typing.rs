//! Type coercion: value conversion, natural-type inference, and the registry of
//! default types keyed by field name.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};

use crate::{
    data::{self, TIMESTAMP_KEY, Value},
    schema::DataType,
};

/// Converts values between [`DataType`]s and infers natural types.
///
/// Implementations are shared by every call on a processor and must be safe
/// for concurrent use.
pub trait TypeCoercion: Send + Sync {
    fn convert(&self, to: DataType, value: Value) -> Result<Value>;

    fn infer_type(&self, value: &Value) -> Result<DataType>;

    fn reformat_value(&self, value: serde_json::Value) -> Value {
        Value::from_json(value)
    }

    fn default_type(&self, field: &str) -> Option<DataType>;

    fn type_name(&self, data_type: DataType) -> String {
        data_type.to_string()
    }
}

pub fn builtin_default_types() -> BTreeMap<String, DataType> {
    BTreeMap::from([
        (TIMESTAMP_KEY.to_string(), DataType::Timestamp),
        ("eventn_ctx_utc_time".to_string(), DataType::Timestamp),
        ("eventn_ctx_interval".to_string(), DataType::Integer),
    ])
}

#[derive(Debug, Clone)]
pub struct StandardTyping {
    default_types: BTreeMap<String, DataType>,
}

impl Default for StandardTyping {
    fn default() -> Self {
        StandardTyping {
            default_types: builtin_default_types(),
        }
    }
}

impl StandardTyping {
    /// Built-in defaults extended (or overridden) by `overrides`.
    pub fn with_default_types(overrides: BTreeMap<String, DataType>) -> Self {
        let mut default_types = builtin_default_types();
        default_types.extend(overrides);
        StandardTyping { default_types }
    }

    pub fn default_types(&self) -> &BTreeMap<String, DataType> {
        &self.default_types
    }
}

impl TypeCoercion for StandardTyping {
    fn convert(&self, to: DataType, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(value);
        }
        let from = self.infer_type(&value)?;
        if from == to {
            return Ok(value);
        }
        let converted = match (to, value) {
            (DataType::String, other) => Value::String(other.as_display()),
            (DataType::Json, other) => Value::Json(other.to_json()),
            (DataType::Float, Value::Integer(i)) => Value::Float(integer_to_float(i)?),
            (DataType::Float, Value::Boolean(b)) => Value::Float(if b { 1.0 } else { 0.0 }),
            (DataType::Float, Value::String(s)) => Value::Float(
                s.trim()
                    .parse()
                    .with_context(|| format!("Failed to parse '{s}' as float"))?,
            ),
            (DataType::Integer, Value::String(s)) => Value::Integer(
                s.trim()
                    .parse()
                    .with_context(|| format!("Failed to parse '{s}' as integer"))?,
            ),
            (DataType::Integer, Value::Float(f)) => Value::Integer(float_to_integer(f)?),
            (DataType::Integer, Value::Boolean(b)) => Value::Integer(i64::from(b)),
            (DataType::Boolean, Value::String(s)) => Value::Boolean(parse_boolean(&s)?),
            (DataType::Boolean, Value::Integer(i)) => match i {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                _ => bail!("Failed to convert {i} to boolean"),
            },
            (DataType::Timestamp, Value::String(s)) => Value::Timestamp(parse_any_timestamp(&s)?),
            (to, _) => bail!("No rule for converting {from} to {to}"),
        };
        Ok(converted)
    }

    fn infer_type(&self, value: &Value) -> Result<DataType> {
        match value {
            Value::String(_) => Ok(DataType::String),
            Value::Integer(_) => Ok(DataType::Integer),
            Value::Float(_) => Ok(DataType::Float),
            Value::Boolean(_) => Ok(DataType::Boolean),
            Value::Timestamp(_) => Ok(DataType::Timestamp),
            Value::Json(_) => Ok(DataType::Json),
            Value::Null => Err(anyhow!("Unknown data type for null value")),
        }
    }

    fn default_type(&self, field: &str) -> Option<DataType> {
        self.default_types.get(field).copied()
    }
}

fn float_to_integer(value: f64) -> Result<i64> {
    if value.fract() != 0.0 || !value.is_finite() {
        bail!("Failed to convert {value} to integer without losing precision");
    }
    if value < i64::MIN as f64 || value >= i64::MAX as f64 {
        bail!("Float {value} is out of integer range");
    }
    Ok(value as i64)
}

/// Widens an integer only when the float holds it exactly.
fn integer_to_float(value: i64) -> Result<f64> {
    let widened = value as f64;
    if widened as i128 != i128::from(value) {
        bail!("Failed to convert {value} to float without losing precision");
    }
    Ok(widened)
}

fn parse_boolean(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Ok(true),
        "false" | "f" | "no" | "n" | "0" => Ok(false),
        _ => Err(anyhow!("Failed to parse '{value}' as boolean")),
    }
}

fn parse_any_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(parsed) = data::parse_timestamp(trimmed) {
        return Ok(parsed);
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|parsed| parsed.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse '{value}' as timestamp"))
}
