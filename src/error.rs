use thiserror::Error;

use crate::template::TemplateError;

/// Failures raised by the processing pipeline.
///
/// Collaborator errors arrive as [`anyhow::Error`] and are kept as the source
/// so their context chain survives into the rendered message.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Error parsing table name template [{template}]: {source}")]
    InvalidTemplate {
        template: String,
        #[source]
        source: TemplateError,
    },

    #[error("Error executing enrichment rule: [{rule}]: {source:#}")]
    Enrichment {
        rule: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error mapping object: {0:#}")]
    Mapping(#[source] anyhow::Error),

    #[error("Error flattening object: {0:#}")]
    Flattening(#[source] anyhow::Error),

    #[error("Error extracting table name. Template: {template}: {message}")]
    TableName { template: String, message: String },

    #[error("Unknown table name. Template: {template}")]
    UnknownTableName { template: String },

    #[error("Error getting type of field [{field}]: {source:#}")]
    FieldType {
        field: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error default converting field [{field}]: {source:#}")]
    DefaultConversion {
        field: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error converting field [{field}] to [{data_type}]: {source:#}")]
    FieldConversion {
        field: String,
        data_type: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error applying DB type [{data_type}] to input [{field}] field with [{value}] value: {source:#}")]
    DbTyping {
        field: String,
        data_type: String,
        value: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Table [{table}] doesn't contain column [{field}] required by input object")]
    MissingColumn { table: String, field: String },

    #[error("Error parsing line in [{file}] file: {source:#}")]
    Parse {
        file: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error reading line in [{file}] file: {source}")]
    Read {
        file: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ProcessingResult<T> = std::result::Result<T, ProcessingError>;
