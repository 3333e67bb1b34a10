//! Enrichment rules applied to raw events before mapping.
//!
//! Event context lives under `eventn_ctx`. When an event carries a non-object
//! `eventn_ctx`, rules write the flattened key (`eventn_ctx_<field>`) instead.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::data::{self, Record, TIMESTAMP_KEY};

pub const EVENTN_KEY: &str = "eventn_ctx";
pub const EVENT_ID_KEY: &str = "event_id";
pub const COLLECTION_ID_KEY: &str = "collection_id";

pub trait EnrichmentRule: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, object: &mut Record) -> Result<()>;
}

/// Adds a generated `eventn_ctx.event_id` to events that lack one.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventIdRule;

impl EnrichmentRule for EventIdRule {
    fn name(&self) -> &str {
        "event_id"
    }

    fn execute(&self, object: &mut Record) -> Result<()> {
        enrich_context_field(object, EVENT_ID_KEY, || Uuid::new_v4().to_string());
        Ok(())
    }
}

/// Tags events with the collection they were received on.
#[derive(Debug, Clone)]
pub struct CollectionRule {
    collection: String,
}

impl CollectionRule {
    pub fn new(collection: impl Into<String>) -> Self {
        CollectionRule {
            collection: collection.into(),
        }
    }
}

impl EnrichmentRule for CollectionRule {
    fn name(&self) -> &str {
        "collection"
    }

    fn execute(&self, object: &mut Record) -> Result<()> {
        enrich_context_field(object, COLLECTION_ID_KEY, || self.collection.clone());
        Ok(())
    }
}

/// Stamps events that arrive without `_timestamp` with the current time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampRule;

impl EnrichmentRule for TimestampRule {
    fn name(&self) -> &str {
        "timestamp"
    }

    fn execute(&self, object: &mut Record) -> Result<()> {
        match object.get(TIMESTAMP_KEY) {
            None | Some(Value::Null) => {
                object.insert(
                    TIMESTAMP_KEY.to_string(),
                    Value::String(data::now_timestamp()),
                );
                Ok(())
            }
            Some(Value::String(_)) => Ok(()),
            Some(other) => bail!("{TIMESTAMP_KEY} must be a string, got {other}"),
        }
    }
}

fn enrich_context_field<F>(object: &mut Record, field: &str, value: F)
where
    F: FnOnce() -> String,
{
    match object.get_mut(EVENTN_KEY) {
        None => {
            let mut context = Record::new();
            context.insert(field.to_string(), Value::String(value()));
            object.insert(EVENTN_KEY.to_string(), Value::Object(context));
        }
        Some(Value::Object(context)) => {
            if !context.contains_key(field) {
                context.insert(field.to_string(), Value::String(value()));
            }
        }
        Some(_) => {
            object.insert(format!("{EVENTN_KEY}_{field}"), Value::String(value()));
        }
    }
}

/// Best-effort event identifier of a raw or flattened event.
pub fn extract_event_id(object: &Record) -> String {
    if let Some(Value::Object(context)) = object.get(EVENTN_KEY)
        && let Some(id) = context.get(EVENT_ID_KEY)
    {
        return display_id(id);
    }
    object
        .get(&format!("{EVENTN_KEY}_{EVENT_ID_KEY}"))
        .map(display_id)
        .unwrap_or_default()
}

fn display_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Configuration entry for a built-in rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleConfig {
    EventId,
    Collection { name: String },
    Timestamp,
}

impl RuleConfig {
    pub fn build(&self) -> Box<dyn EnrichmentRule> {
        match self {
            RuleConfig::EventId => Box::new(EventIdRule),
            RuleConfig::Collection { name } => Box::new(CollectionRule::new(name.clone())),
            RuleConfig::Timestamp => Box::new(TimestampRule),
        }
    }
}
