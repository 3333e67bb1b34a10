//! Field mapping: moving, removing, and re-typing fields before flattening.
//!
//! Rules address fields with `/`-separated paths (`/eventn_ctx/user/id`).
//! Type casts declared on a rule are keyed by the flattened destination name
//! (`eventn_ctx_user_id`) because they are applied after flattening.

use std::{collections::BTreeMap, sync::LazyLock};

use anyhow::{Result, anyhow, bail, ensure};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    data::{Record, normalize_field_name},
    schema::DataType,
};

/// `/src -> /dst` (move) or `/src -> ` (remove).
static LEGACY_RULE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^\s*(/\S*)\s*->\s*(/\S*)?\s*$"));

pub trait FieldMapper: Send + Sync {
    fn map(&self, object: Record) -> Result<Record>;

    /// Per-field forced types, keyed by flattened field name.
    fn type_casts(&self) -> BTreeMap<String, DataType> {
        BTreeMap::new()
    }
}

/// Passes records through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMapper;

impl FieldMapper for NoopMapper {
    fn map(&self, object: Record) -> Result<Record> {
        Ok(object)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingAction {
    Move,
    Remove,
    Cast,
    Constant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldMappingType {
    #[default]
    Default,
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingField {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    pub action: MappingAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl MappingField {
    fn validate(&self) -> Result<()> {
        match self.action {
            MappingAction::Move => {
                ensure!(self.src.is_some(), "'move' mapping requires 'src'");
                ensure!(self.dst.is_some(), "'move' mapping requires 'dst'");
            }
            MappingAction::Remove => {
                ensure!(self.src.is_some(), "'remove' mapping requires 'src'");
            }
            MappingAction::Cast => {
                ensure!(self.dst.is_some(), "'cast' mapping requires 'dst'");
                ensure!(self.data_type.is_some(), "'cast' mapping requires 'type'");
            }
            MappingAction::Constant => {
                ensure!(self.dst.is_some(), "'constant' mapping requires 'dst'");
                ensure!(self.value.is_some(), "'constant' mapping requires 'value'");
            }
        }
        for path in [&self.src, &self.dst].into_iter().flatten() {
            parse_path(path)?;
        }
        Ok(())
    }

    /// Parses a legacy rule such as `/a/b -> /c` (move) or `/a -> ` (remove).
    pub fn parse_legacy(rule: &str) -> Result<Self> {
        let pattern = LEGACY_RULE
            .as_ref()
            .map_err(|err| anyhow!("Invalid legacy mapping pattern: {err}"))?;
        let captures = pattern
            .captures(rule)
            .ok_or_else(|| anyhow!("Malformed mapping rule '{rule}': expected '/src -> /dst'"))?;
        let src = captures[1].to_string();
        let field = match captures.get(2) {
            Some(dst) => MappingField {
                src: Some(src),
                action: MappingAction::Move,
                dst: Some(dst.as_str().to_string()),
                data_type: None,
                value: None,
            },
            None => MappingField {
                src: Some(src),
                action: MappingAction::Remove,
                dst: None,
                data_type: None,
                value: None,
            },
        };
        field.validate()?;
        Ok(field)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mappings {
    #[serde(default = "Mappings::default_keep_unmapped")]
    pub keep_unmapped: bool,
    #[serde(default)]
    pub fields: Vec<MappingField>,
}

impl Default for Mappings {
    fn default() -> Self {
        Mappings {
            keep_unmapped: true,
            fields: Vec::new(),
        }
    }
}

impl Mappings {
    pub const fn default_keep_unmapped() -> bool {
        true
    }

    pub fn from_legacy(mapping_type: FieldMappingType, rules: &[String]) -> Result<Self> {
        let fields = rules
            .iter()
            .map(|rule| rule.trim())
            .filter(|rule| !rule.is_empty())
            .map(MappingField::parse_legacy)
            .collect::<Result<Vec<_>>>()?;
        Ok(Mappings {
            keep_unmapped: mapping_type == FieldMappingType::Default,
            fields,
        })
    }
}

/// Applies a validated [`Mappings`] definition.
#[derive(Debug, Clone)]
pub struct ConfiguredMapper {
    mappings: Mappings,
    type_casts: BTreeMap<String, DataType>,
}

impl ConfiguredMapper {
    pub fn new(mappings: Mappings) -> Result<Self> {
        let mut type_casts = BTreeMap::new();
        for field in &mappings.fields {
            field.validate()?;
            if let (Some(dst), Some(data_type)) = (&field.dst, field.data_type) {
                type_casts.insert(flat_name(dst)?, data_type);
            }
        }
        Ok(ConfiguredMapper {
            mappings,
            type_casts,
        })
    }
}

impl FieldMapper for ConfiguredMapper {
    fn map(&self, object: Record) -> Result<Record> {
        if self.mappings.keep_unmapped {
            let mut mapped = object;
            for field in &self.mappings.fields {
                match field.action {
                    MappingAction::Move => {
                        if let Some(value) = remove_path(&mut mapped, required(&field.src)?)? {
                            set_path(&mut mapped, required(&field.dst)?, value)?;
                        }
                    }
                    MappingAction::Remove => {
                        remove_path(&mut mapped, required(&field.src)?)?;
                    }
                    MappingAction::Constant => {
                        set_path(&mut mapped, required(&field.dst)?, constant(field)?)?;
                    }
                    MappingAction::Cast => {}
                }
            }
            Ok(mapped)
        } else {
            let mut mapped = Record::new();
            for field in &self.mappings.fields {
                match field.action {
                    MappingAction::Move => {
                        if let Some(value) = get_path(&object, required(&field.src)?)? {
                            set_path(&mut mapped, required(&field.dst)?, value.clone())?;
                        }
                    }
                    MappingAction::Constant => {
                        set_path(&mut mapped, required(&field.dst)?, constant(field)?)?;
                    }
                    MappingAction::Remove | MappingAction::Cast => {}
                }
            }
            Ok(mapped)
        }
    }

    fn type_casts(&self) -> BTreeMap<String, DataType> {
        self.type_casts.clone()
    }
}

fn required(path: &Option<String>) -> Result<&str> {
    path.as_deref()
        .ok_or_else(|| anyhow!("mapping rule is missing a path"))
}

fn constant(field: &MappingField) -> Result<Value> {
    field
        .value
        .clone()
        .ok_or_else(|| anyhow!("'constant' mapping requires 'value'"))
}

fn parse_path(path: &str) -> Result<Vec<&str>> {
    let trimmed = path.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        bail!("Mapping path '{path}' must start with '/'");
    };
    let segments: Vec<&str> = rest.split('/').collect();
    ensure!(
        segments.iter().all(|segment| !segment.is_empty()),
        "Mapping path '{path}' contains an empty segment"
    );
    Ok(segments)
}

fn flat_name(path: &str) -> Result<String> {
    Ok(parse_path(path)?
        .into_iter()
        .map(normalize_field_name)
        .collect::<Vec<_>>()
        .join("_"))
}

fn get_path<'a>(object: &'a Record, path: &str) -> Result<Option<&'a Value>> {
    let segments = parse_path(path)?;
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| anyhow!("Mapping path '{path}' is empty"))?;
    let mut current = object;
    for segment in parents {
        match current.get(*segment) {
            Some(Value::Object(next)) => current = next,
            _ => return Ok(None),
        }
    }
    Ok(current.get(*last))
}

fn remove_path(object: &mut Record, path: &str) -> Result<Option<Value>> {
    let segments = parse_path(path)?;
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| anyhow!("Mapping path '{path}' is empty"))?;
    let mut current = object;
    for segment in parents {
        match current.get_mut(*segment) {
            Some(Value::Object(next)) => current = next,
            _ => return Ok(None),
        }
    }
    Ok(current.remove(*last))
}

fn set_path(object: &mut Record, path: &str, value: Value) -> Result<()> {
    let segments = parse_path(path)?;
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| anyhow!("Mapping path '{path}' is empty"))?;
    let mut current = object;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Record::new()));
        match entry {
            Value::Object(next) => current = next,
            _ => bail!("Can't set value at '{path}': '{segment}' is not an object"),
        }
    }
    current.insert(last.to_string(), value);
    Ok(())
}
