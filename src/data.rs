//! Record and value representations shared by every pipeline stage.
//!
//! Incoming events are loosely typed JSON objects ([`Record`]). Once a record
//! has been flattened and typed, each field holds a [`Value`] whose variant
//! matches the column type resolved for it.

use std::{collections::BTreeMap, fmt};

use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Number;

/// A raw (or flattened) event: field name to arbitrary JSON value.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// A flattened event whose values have been converted to their column types.
pub type TypedRecord = BTreeMap<String, Value>;

/// Field every event must carry for table-name extraction.
pub const TIMESTAMP_KEY: &str = "_timestamp";

/// Layout used to parse `_timestamp`. The fractional part is optional on parse.
pub const TIMESTAMP_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

const TIMESTAMP_OUTPUT_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    /// Converts a decoded JSON value into its concrete typed form.
    ///
    /// Numbers decoded without a fixed precision are split into integers and
    /// floats here. Integers outside the `i64` range are kept as JSON numbers
    /// instead of being rounded through `f64`.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Number(n) => reformat_number(n),
            other => Value::Json(other),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Timestamp(ts) => serde_json::Value::String(format_timestamp(ts)),
            Value::Json(v) => v.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_display(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::String(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Timestamp(ts) => format_timestamp(ts),
            Value::Json(v) => v.to_string(),
        }
    }
}

fn reformat_number(n: Number) -> Value {
    if let Some(i) = n.as_i64() {
        return Value::Integer(i);
    }
    if n.is_u64() {
        return Value::Json(serde_json::Value::Number(n));
    }
    match n.as_f64() {
        Some(f) if f.is_finite() => Value::Float(f),
        _ => Value::Json(serde_json::Value::Number(n)),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::String(s) => serializer.serialize_str(s),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Timestamp(ts) => serializer.serialize_str(&format_timestamp(ts)),
            Value::Json(v) => v.serialize(serializer),
        }
    }
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_LAYOUT)
        .map(|naive| naive.and_utc())
        .map_err(|err| anyhow!("parsing time \"{value}\" as \"{TIMESTAMP_LAYOUT}\": {err}"))
}

pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.format(TIMESTAMP_OUTPUT_LAYOUT).to_string()
}

/// Now, in the fixed timestamp layout.
pub fn now_timestamp() -> String {
    format_timestamp(&Utc::now())
}

/// Normalizes a field name for use as a flattened column key.
pub fn normalize_field_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    #[test]
    fn normalize_field_name_replaces_separators() {
        assert_eq!(normalize_field_name("user agent"), "user_agent");
        assert_eq!(normalize_field_name("page-url"), "page_url");
        assert_eq!(normalize_field_name("Event_ID"), "Event_ID");
    }

    #[test]
    fn parse_timestamp_accepts_optional_fraction() {
        let whole = parse_timestamp("2020-05-01T10:00:00Z").unwrap();
        assert_eq!(whole.year(), 2020);
        assert_eq!(whole.hour(), 10);

        let fractional = parse_timestamp("2020-05-01T10:00:00.123456Z").unwrap();
        assert_eq!(fractional.nanosecond(), 123_456_000);
    }

    #[test]
    fn parse_timestamp_rejects_other_layouts() {
        assert!(parse_timestamp("2020/05/01 10:00:00").is_err());
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_timestamp("2020-05-01T10:00:00+02:00").is_err());
    }

    #[test]
    fn format_timestamp_uses_six_fraction_digits() {
        let ts = parse_timestamp("2020-05-01T10:00:00Z").unwrap();
        assert_eq!(format_timestamp(&ts), "2020-05-01T10:00:00.000000Z");
    }

    #[test]
    fn from_json_splits_numbers_without_losing_precision() {
        assert_eq!(Value::from_json(json!(42)), Value::Integer(42));
        assert_eq!(Value::from_json(json!(-7)), Value::Integer(-7));
        assert_eq!(Value::from_json(json!(1.5)), Value::Float(1.5));
        assert_eq!(
            Value::from_json(json!(u64::MAX)),
            Value::Json(json!(u64::MAX))
        );
        assert_eq!(Value::from_json(json!(null)), Value::Null);
        assert_eq!(Value::from_json(json!("x")), Value::String("x".into()));
    }

    #[test]
    fn serialize_writes_plain_json() {
        let ts = parse_timestamp("2021-01-02T03:04:05Z").unwrap();
        let rendered = serde_json::to_string(&Value::Timestamp(ts)).unwrap();
        assert_eq!(rendered, "\"2021-01-02T03:04:05.000000Z\"");
        assert_eq!(serde_json::to_string(&Value::Integer(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&Value::Null).unwrap(), "null");
    }
}
