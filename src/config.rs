//! YAML configuration for building a [`Processor`].
//!
//! ```yaml
//! table_name_template: 'events_{{._timestamp.Format "2006_01"}}'
//! primary_key_fields: [eventn_ctx_event_id]
//! mappings:
//!   type: default            # legacy rules: `default` keeps unmapped fields
//!   rules:
//!     - /src/path -> /dst/path
//!   fields:
//!     - src: /page/url
//!       action: move
//!       dst: /url
//!     - dst: /amount
//!       action: cast
//!       type: float
//! enrichment:
//!   - type: event_id
//!   - type: collection
//!     name: web
//! default_types:
//!   revenue: float
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::Read,
    path::Path,
};

use anyhow::{Context, Result, ensure};
use log::debug;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    enrichment::RuleConfig,
    mapping::{ConfiguredMapper, FieldMapper, FieldMappingType, MappingField, Mappings, NoopMapper},
    processor::Processor,
    schema::DataType,
    typing::StandardTyping,
};

pub const DEFAULT_TABLE_NAME_TEMPLATE: &str = "events";

fn read_to_string(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("Opening YAML file {path:?}"))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)
        .with_context(|| format!("Reading YAML file {path:?}"))?;
    Ok(buf)
}

pub fn load_from_path<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = read_to_string(path)?;
    serde_yaml::from_str(&raw).with_context(|| format!("Parsing YAML file {path:?}"))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingsConfig {
    /// Policy for legacy `rules`.
    #[serde(default, rename = "type")]
    pub mapping_type: FieldMappingType,
    /// Legacy `/src -> /dst` rules.
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_unmapped: Option<bool>,
    #[serde(default)]
    pub fields: Vec<MappingField>,
}

impl MappingsConfig {
    /// Combined mapping definition, or `None` when no mapping is configured.
    /// Legacy rules run before `fields`.
    pub fn resolve(&self) -> Result<Option<Mappings>> {
        if self.rules.is_empty() && self.fields.is_empty() {
            return Ok(None);
        }
        let mut mappings = Mappings::from_legacy(self.mapping_type, &self.rules)
            .context("Parsing legacy mapping rules")?;
        mappings.fields.extend(self.fields.iter().cloned());
        if let Some(keep_unmapped) = self.keep_unmapped {
            mappings.keep_unmapped = keep_unmapped;
        }
        Ok(Some(mappings))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorConfig {
    #[serde(default = "default_table_name_template")]
    pub table_name_template: String,
    #[serde(default)]
    pub primary_key_fields: BTreeSet<String>,
    #[serde(default)]
    pub mappings: MappingsConfig,
    #[serde(default)]
    pub enrichment: Vec<RuleConfig>,
    #[serde(default)]
    pub default_types: BTreeMap<String, DataType>,
}

fn default_table_name_template() -> String {
    DEFAULT_TABLE_NAME_TEMPLATE.to_string()
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            table_name_template: default_table_name_template(),
            primary_key_fields: BTreeSet::new(),
            mappings: MappingsConfig::default(),
            enrichment: Vec::new(),
            default_types: BTreeMap::new(),
        }
    }
}

impl ProcessorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        load_from_path(path).with_context(|| format!("Loading processor config from {path:?}"))
    }

    pub fn build(&self) -> Result<Processor> {
        ensure!(
            !self.table_name_template.trim().is_empty(),
            "table_name_template must not be empty"
        );
        let mapper: Box<dyn FieldMapper> = match self.mappings.resolve()? {
            Some(mappings) => {
                debug!("Using {} field mapping(s)", mappings.fields.len());
                Box::new(ConfiguredMapper::new(mappings).context("Validating field mappings")?)
            }
            None => Box::new(NoopMapper),
        };
        let rules = self.enrichment.iter().map(RuleConfig::build).collect();
        let processor = Processor::new(
            &self.table_name_template,
            mapper,
            self.primary_key_fields.clone(),
            rules,
        )?
        .with_typing(Box::new(StandardTyping::with_default_types(
            self.default_types.clone(),
        )));
        Ok(processor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;
    use serde_json::json;
    use std::io::Write;

    fn record(value: serde_json::Value) -> crate::data::Record {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: ProcessorConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, ProcessorConfig::default());
        assert_eq!(config.mappings.resolve().unwrap(), None);
        assert_eq!(config.build().unwrap().table_name_template(), "events");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_yaml::from_str::<ProcessorConfig>("table_template: x\n").is_err());
    }

    #[test]
    fn legacy_rules_run_before_fields() {
        let yaml = r#"
mappings:
  type: strict
  rules:
    - /a -> /b
  fields:
    - dst: /b
      action: cast
      type: string
"#;
        let config: ProcessorConfig = serde_yaml::from_str(yaml).unwrap();
        let mappings = config.mappings.resolve().unwrap().unwrap();
        assert!(!mappings.keep_unmapped);
        assert_eq!(mappings.fields.len(), 2);
    }

    #[test]
    fn built_processor_honours_every_section() {
        let yaml = r#"
table_name_template: "events_{{.app}}"
primary_key_fields: [id]
mappings:
  fields:
    - dst: /id
      action: cast
      type: string
enrichment:
  - type: collection
    name: web
default_types:
  amount: float
"#;
        let config: ProcessorConfig = serde_yaml::from_str(yaml).unwrap();
        let processor = config.build().unwrap();
        let (table, typed) = processor
            .process_fact(&record(json!({
                "_timestamp": "2020-05-01T10:00:00Z",
                "app": "Shop",
                "id": 5,
                "amount": 3,
            })))
            .unwrap();
        assert_eq!(table.name, "events_shop");
        assert!(table.pk_fields.contains("id"));
        assert_eq!(typed["id"], Value::String("5".into()));
        assert_eq!(typed["amount"], Value::Float(3.0));
        assert_eq!(
            typed["eventn_ctx_collection_id"],
            Value::String("web".into())
        );
    }

    #[test]
    fn load_reads_yaml_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "table_name_template: clicks").unwrap();
        let config = ProcessorConfig::load(file.path()).unwrap();
        assert_eq!(config.table_name_template, "clicks");
        assert!(ProcessorConfig::load(Path::new("/nonexistent/config.yaml")).is_err());
    }

    #[test]
    fn blank_template_is_rejected() {
        let config = ProcessorConfig {
            table_name_template: "  ".to_string(),
            ..ProcessorConfig::default()
        };
        assert!(config.build().is_err());
    }
}
