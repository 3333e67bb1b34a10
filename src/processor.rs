//! The event processing pipeline.
//!
//! A [`Processor`] turns loosely typed events into typed, flattened records
//! grouped by destination table. Every event goes through the same fixed
//! sequence of stages:
//!
//! 1. copy (the caller's event is never modified)
//! 2. enrichment rules, in configured order
//! 3. field mapping
//! 4. flattening
//! 5. table-name extraction
//! 6. per-field typing: mapping cast, then default type, then inference
//!
//! Three entry points share that sequence. [`Processor::process_fact`]
//! handles one event, [`Processor::process_objects`] handles a batch and
//! fails as a whole on the first bad event, and
//! [`Processor::process_file_payload`] reads newline-delimited events and can
//! either stop at the first failure or set failing lines aside as
//! [`FailedFact`]s.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::{BufRead, BufReader},
};

use anyhow::{Context, anyhow, bail};
use log::{debug, warn};
use serde::{Serialize, Serializer, ser::SerializeStruct};
use serde_json::Value as JsonValue;

use crate::{
    data::{Record, TypedRecord, Value},
    enrichment::{EnrichmentRule, extract_event_id},
    error::{ProcessingError, ProcessingResult},
    flatten::{Flattener, JsonFlattener},
    mapping::FieldMapper,
    schema::{Column, DataType, Table},
    template::TableNameExtractor,
    typing::{StandardTyping, TypeCoercion},
};

const PAYLOAD_BUFFER_SIZE: usize = 64 * 1024;

/// Typed records for one destination table together with their merged schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedFile {
    pub file_name: Option<String>,
    pub data_schema: Table,
    payload: Vec<TypedRecord>,
}

impl ProcessedFile {
    fn new(file_name: Option<&str>, data_schema: Table, first: TypedRecord) -> Self {
        ProcessedFile {
            file_name: file_name.map(str::to_string),
            data_schema,
            payload: vec![first],
        }
    }

    fn append(&mut self, table: &Table, record: TypedRecord) {
        self.data_schema.columns.merge(&table.columns);
        self.payload.push(record);
    }

    pub fn payload(&self) -> &[TypedRecord] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<TypedRecord> {
        self.payload
    }
}

/// An input line that could not be processed, kept for fallback storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFact {
    /// The line exactly as received, without its terminator.
    pub event: Vec<u8>,
    pub error: String,
    pub event_id: String,
}

impl Serialize for FailedFact {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let event = serde_json::from_slice::<JsonValue>(&self.event)
            .unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(&self.event).into_owned()));
        let mut state = serializer.serialize_struct("FailedFact", 3)?;
        state.serialize_field("event", &event)?;
        state.serialize_field("error", &self.error)?;
        state.serialize_field("event_id", &self.event_id)?;
        state.end()
    }
}

/// Parses one payload line holding a single JSON object.
pub fn parse_json_line(line: &[u8]) -> anyhow::Result<Record> {
    let value: JsonValue = serde_json::from_slice(line).context("Decoding JSON line")?;
    match value {
        JsonValue::Object(object) => Ok(object),
        other => bail!("expected a JSON object, got {}", json_kind(&other)),
    }
}

/// Parses one fallback-file line and returns the original event it carries.
pub fn parse_fallback_line(line: &[u8]) -> anyhow::Result<Record> {
    let mut entry = parse_json_line(line).context("Decoding fallback line")?;
    match entry.remove("event") {
        Some(JsonValue::Object(event)) => Ok(event),
        Some(JsonValue::String(raw)) => parse_json_line(raw.as_bytes())
            .context("Decoding event stored as text in fallback line"),
        Some(other) => Err(anyhow!(
            "fallback event must be an object, got {}",
            json_kind(&other)
        )),
        None => bail!("fallback line has no event field"),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Immutable, shareable event processing pipeline.
pub struct Processor {
    flattener: Box<dyn Flattener>,
    field_mapper: Box<dyn FieldMapper>,
    type_casts: BTreeMap<String, DataType>,
    typing: Box<dyn TypeCoercion>,
    table_name_extractor: TableNameExtractor,
    pk_fields: BTreeSet<String>,
    enrichment_rules: Vec<Box<dyn EnrichmentRule>>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("table_name_template", &self.table_name_extractor.expression())
            .field("type_casts", &self.type_casts)
            .field("pk_fields", &self.pk_fields)
            .field(
                "enrichment_rules",
                &self
                    .enrichment_rules
                    .iter()
                    .map(|rule| rule.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Processor {
    /// Builds a processor with the standard flattener and type coercion.
    ///
    /// Fails when `table_name_template` does not compile.
    pub fn new(
        table_name_template: &str,
        field_mapper: Box<dyn FieldMapper>,
        pk_fields: BTreeSet<String>,
        enrichment_rules: Vec<Box<dyn EnrichmentRule>>,
    ) -> ProcessingResult<Self> {
        let table_name_extractor = TableNameExtractor::new(table_name_template).map_err(
            |source| ProcessingError::InvalidTemplate {
                template: table_name_template.to_string(),
                source,
            },
        )?;
        Ok(Processor {
            flattener: Box::new(JsonFlattener::default()),
            type_casts: field_mapper.type_casts(),
            field_mapper,
            typing: Box::new(StandardTyping::default()),
            table_name_extractor,
            pk_fields,
            enrichment_rules,
        })
    }

    pub fn with_typing(mut self, typing: Box<dyn TypeCoercion>) -> Self {
        self.typing = typing;
        self
    }

    pub fn with_flattener(mut self, flattener: Box<dyn Flattener>) -> Self {
        self.flattener = flattener;
        self
    }

    pub fn table_name_template(&self) -> &str {
        self.table_name_extractor.expression()
    }

    pub fn pk_fields(&self) -> &BTreeSet<String> {
        &self.pk_fields
    }

    /// Processes a single event.
    pub fn process_fact(&self, fact: &Record) -> ProcessingResult<(Table, TypedRecord)> {
        self.process_object(fact)
    }

    /// Processes a batch of parsed events, grouped by table.
    ///
    /// The first failing event fails the whole call and no partial result is
    /// returned. Events that yield a table without columns are skipped.
    pub fn process_objects(
        &self,
        objects: &[Record],
    ) -> ProcessingResult<BTreeMap<String, ProcessedFile>> {
        let mut per_table = BTreeMap::new();
        for object in objects {
            let (table, record) = self.process_object(object)?;
            collect(&mut per_table, None, table, record);
        }
        Ok(per_table)
    }

    /// Processes a newline-delimited payload, one event per line.
    ///
    /// `parse` failures are fatal. Processing failures either fail the call
    /// (`break_on_error`) or are returned as [`FailedFact`]s while the rest of
    /// the payload is processed. The final line does not need a terminator;
    /// blank lines are ignored.
    pub fn process_file_payload<F>(
        &self,
        file_name: &str,
        payload: &[u8],
        break_on_error: bool,
        parse: F,
    ) -> ProcessingResult<(BTreeMap<String, ProcessedFile>, Vec<FailedFact>)>
    where
        F: Fn(&[u8]) -> anyhow::Result<Record>,
    {
        let mut per_table = BTreeMap::new();
        let mut failed_facts = Vec::new();
        let mut reader = BufReader::with_capacity(PAYLOAD_BUFFER_SIZE, payload);
        let mut buffer = Vec::new();
        let mut lines = 0usize;
        loop {
            buffer.clear();
            let read = reader
                .read_until(b'\n', &mut buffer)
                .map_err(|source| ProcessingError::Read {
                    file: file_name.to_string(),
                    source,
                })?;
            if read == 0 {
                break;
            }
            let line = buffer.strip_suffix(b"\n").unwrap_or(&buffer[..]);
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            lines += 1;

            let object = parse(line).map_err(|source| ProcessingError::Parse {
                file: file_name.to_string(),
                source,
            })?;
            match self.process_object(&object) {
                Ok((table, record)) => collect(&mut per_table, Some(file_name), table, record),
                Err(err) if break_on_error => return Err(err),
                Err(err) => {
                    warn!(
                        "Unable to process object {}: {err}. This line will be stored in fallback.",
                        String::from_utf8_lossy(line)
                    );
                    failed_facts.push(FailedFact {
                        event: line.to_vec(),
                        error: err.to_string(),
                        event_id: extract_event_id(&object),
                    });
                }
            }
        }
        debug!(
            "Processed {lines} line(s) from [{file_name}] into {} table(s); {} failed",
            per_table.len(),
            failed_facts.len()
        );
        Ok((per_table, failed_facts))
    }

    /// Converts every record of `file` to the column types of `db_schema`.
    ///
    /// Either every record is converted or, on error, `file` is left as it was.
    pub fn apply_db_typing(
        &self,
        db_schema: &Table,
        file: &mut ProcessedFile,
    ) -> ProcessingResult<()> {
        let converted = file
            .payload
            .iter()
            .map(|record| -> ProcessingResult<TypedRecord> {
                let mut record = record.clone();
                self.apply_db_typing_to_object(db_schema, &mut record)?;
                Ok(record)
            })
            .collect::<ProcessingResult<Vec<_>>>()?;
        file.payload = converted;
        Ok(())
    }

    /// Converts every field of `object` to its column type in `db_schema`.
    ///
    /// The set of keys is unchanged. A field without a column in `db_schema`
    /// is an error, and on error `object` is left as it was.
    pub fn apply_db_typing_to_object(
        &self,
        db_schema: &Table,
        object: &mut TypedRecord,
    ) -> ProcessingResult<()> {
        let mut converted = Vec::with_capacity(object.len());
        for (field, value) in object.iter() {
            let column =
                db_schema
                    .columns
                    .get(field)
                    .ok_or_else(|| ProcessingError::MissingColumn {
                        table: db_schema.name.clone(),
                        field: field.clone(),
                    })?;
            let data_type = column.data_type();
            let typed = self
                .typing
                .convert(data_type, value.clone())
                .map_err(|source| ProcessingError::DbTyping {
                    field: field.clone(),
                    data_type: self.typing.type_name(data_type),
                    value: value.to_string(),
                    source,
                })?;
            converted.push((field.clone(), typed));
        }
        object.extend(converted);
        Ok(())
    }

    fn process_object(&self, source: &Record) -> ProcessingResult<(Table, TypedRecord)> {
        let mut object = source.clone();
        for rule in &self.enrichment_rules {
            rule.execute(&mut object)
                .map_err(|err| ProcessingError::Enrichment {
                    rule: rule.name().to_string(),
                    source: err,
                })?;
        }

        let mapped = self
            .field_mapper
            .map(object)
            .map_err(ProcessingError::Mapping)?;
        let flat = self
            .flattener
            .flatten(&mapped)
            .map_err(ProcessingError::Flattening)?;

        let table_name = self.table_name_extractor.extract(&flat).map_err(|err| {
            ProcessingError::TableName {
                template: self.table_name_template().to_string(),
                message: format!("{err:#}"),
            }
        })?;
        if table_name.is_empty() {
            return Err(ProcessingError::UnknownTableName {
                template: self.table_name_template().to_string(),
            });
        }

        let mut table = Table::new(table_name, self.pk_fields.clone());
        let mut record = TypedRecord::new();
        for (field, raw) in flat {
            let value = self.typing.reformat_value(raw);
            let (data_type, value) = self.resolve_field(&field, value)?;
            table.columns.insert(field.clone(), Column::new(data_type));
            record.insert(field, value);
        }
        Ok((table, record))
    }

    fn resolve_field(&self, field: &str, value: Value) -> ProcessingResult<(DataType, Value)> {
        if let Some(&cast) = self.type_casts.get(field) {
            let converted = self.typing.convert(cast, value).map_err(|source| {
                ProcessingError::FieldConversion {
                    field: field.to_string(),
                    data_type: self.typing.type_name(cast),
                    source,
                }
            })?;
            return Ok((cast, converted));
        }
        if let Some(default) = self.typing.default_type(field) {
            let converted = self.typing.convert(default, value).map_err(|source| {
                ProcessingError::DefaultConversion {
                    field: field.to_string(),
                    source,
                }
            })?;
            return Ok((default, converted));
        }
        let inferred = self
            .typing
            .infer_type(&value)
            .map_err(|source| ProcessingError::FieldType {
                field: field.to_string(),
                source,
            })?;
        Ok((inferred, value))
    }
}

fn collect(
    per_table: &mut BTreeMap<String, ProcessedFile>,
    file_name: Option<&str>,
    table: Table,
    record: TypedRecord,
) {
    if !table.exists() {
        return;
    }
    match per_table.get_mut(&table.name) {
        Some(file) => file.append(&table, record),
        None => {
            per_table.insert(
                table.name.clone(),
                ProcessedFile::new(file_name, table, record),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::NoopMapper;
    use serde_json::json;

    fn record(value: JsonValue) -> Record {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    fn processor(template: &str) -> Processor {
        Processor::new(template, Box::new(NoopMapper), BTreeSet::new(), Vec::new()).unwrap()
    }

    #[test]
    fn invalid_template_fails_construction() {
        let err = Processor::new("{{if .a}}", Box::new(NoopMapper), BTreeSet::new(), Vec::new())
            .unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidTemplate { .. }));
    }

    #[test]
    fn empty_table_name_is_rejected() {
        let err = processor("{{if .missing}}x{{end}}")
            .process_fact(&record(json!({"_timestamp": "2020-05-01T10:00:00Z"})))
            .unwrap_err();
        assert!(err.to_string().starts_with("Unknown table name. Template:"));
    }

    #[test]
    fn default_types_apply_before_inference() {
        let (table, typed) = processor("events")
            .process_fact(&record(json!({
                "_timestamp": "2020-05-01T10:00:00Z",
                "eventn_ctx": {"interval": "15"},
            })))
            .unwrap();
        assert_eq!(
            table.columns.get("eventn_ctx_interval").unwrap().data_type(),
            DataType::Integer
        );
        assert_eq!(typed["eventn_ctx_interval"], Value::Integer(15));
        assert_eq!(
            table.columns.get("_timestamp").unwrap().data_type(),
            DataType::Timestamp
        );
    }

    #[test]
    fn default_conversion_failure_names_the_field() {
        let err = processor("events")
            .process_fact(&record(json!({
                "_timestamp": "2020-05-01T10:00:00Z",
                "eventn_ctx": {"interval": "soon"},
            })))
            .unwrap_err();
        assert!(
            err.to_string()
                .starts_with("Error default converting field [eventn_ctx_interval]:")
        );
    }

    #[test]
    fn blank_lines_and_missing_final_terminator_are_handled() {
        let payload = b"{\"_timestamp\":\"2020-05-01T10:00:00Z\",\"a\":1}\n\n{\"_timestamp\":\"2020-05-01T10:00:00Z\",\"a\":2}";
        let (files, failed) = processor("events")
            .process_file_payload("f.log", payload, true, parse_json_line)
            .unwrap();
        assert!(failed.is_empty());
        assert_eq!(files["events"].payload().len(), 2);
        assert_eq!(files["events"].file_name.as_deref(), Some("f.log"));
    }

    #[test]
    fn parse_failures_are_fatal_even_when_lenient() {
        let err = processor("events")
            .process_file_payload("f.log", b"not json\n", false, parse_json_line)
            .unwrap_err();
        assert!(err.to_string().starts_with("Error parsing line in [f.log] file:"));
    }

    #[test]
    fn apply_db_typing_is_all_or_nothing() {
        let processor = processor("events");
        let (mut files, _) = processor
            .process_file_payload(
                "f.log",
                b"{\"_timestamp\":\"2020-05-01T10:00:00Z\",\"a\":\"1\"}\n{\"_timestamp\":\"2020-05-01T10:00:00Z\",\"a\":\"x\"}\n",
                true,
                parse_json_line,
            )
            .unwrap();
        let file = files.get_mut("events").unwrap();
        let before = file.clone();

        let mut db_schema = Table::new("events", BTreeSet::new());
        db_schema
            .columns
            .insert("_timestamp", Column::new(DataType::Timestamp));
        db_schema.columns.insert("a", Column::new(DataType::Integer));

        let err = processor.apply_db_typing(&db_schema, file).unwrap_err();
        assert!(
            err.to_string()
                .starts_with("Error applying DB type [integer] to input [a] field with [x] value:")
        );
        assert_eq!(*file, before);
    }

    #[test]
    fn apply_db_typing_requires_every_column() {
        let processor = processor("events");
        let (_, mut typed) = processor
            .process_fact(&record(json!({"_timestamp": "2020-05-01T10:00:00Z", "b": 1})))
            .unwrap();
        let mut db_schema = Table::new("events", BTreeSet::new());
        db_schema
            .columns
            .insert("_timestamp", Column::new(DataType::Timestamp));
        let err = processor
            .apply_db_typing_to_object(&db_schema, &mut typed)
            .unwrap_err();
        assert!(matches!(err, ProcessingError::MissingColumn { ref field, .. } if field == "b"));
    }

    #[test]
    fn failed_fact_serializes_original_event() {
        let fact = FailedFact {
            event: br#"{"a":1}"#.to_vec(),
            error: "boom".to_string(),
            event_id: "id".to_string(),
        };
        let line = serde_json::to_string(&fact).unwrap();
        assert_eq!(line, r#"{"event":{"a":1},"error":"boom","event_id":"id"}"#);
        assert_eq!(parse_fallback_line(line.as_bytes()).unwrap(), record(json!({"a": 1})));

        let garbled = FailedFact {
            event: b"{oops".to_vec(),
            error: "bad".to_string(),
            event_id: String::new(),
        };
        let line = serde_json::to_string(&garbled).unwrap();
        assert!(line.starts_with(r#"{"event":"{oops""#));
    }

    #[test]
    fn parse_json_line_requires_objects() {
        assert!(parse_json_line(b"[1,2]").is_err());
        assert!(parse_json_line(b"{\"a\":1}").is_ok());
    }
}
