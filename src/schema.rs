//! Table schema model: data types, columns, and per-table column merging.
//!
//! This module owns the [`DataType`] taxonomy, [`Column`] (a field together with
//! every type observed for it), [`Columns`] and [`Table`].
//!
//! ## Merge policy
//!
//! A column observed with different types across records keeps all of them and
//! reports their lowest common ancestor in the widening lattice:
//!
//! ```text
//!            string
//!          /   |    \
//!      float timestamp json
//!        |
//!     integer
//!        |
//!     boolean
//! ```
//!
//! Merging is therefore commutative and never narrows a type that has already
//! been accumulated.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::Path,
    str::FromStr,
};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataType {
    Boolean,
    Integer,
    Float,
    Timestamp,
    Json,
    String,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
            DataType::Timestamp => "timestamp",
            DataType::Json => "json",
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &["string", "integer", "float", "boolean", "timestamp", "json"]
    }

    fn parent(self) -> Option<DataType> {
        match self {
            DataType::Boolean => Some(DataType::Integer),
            DataType::Integer => Some(DataType::Float),
            DataType::Float | DataType::Timestamp | DataType::Json => Some(DataType::String),
            DataType::String => None,
        }
    }

    fn ancestors(self) -> Vec<DataType> {
        let mut chain = vec![self];
        let mut current = self;
        while let Some(parent) = current.parent() {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// Lowest type that can represent values of both `self` and `other`.
    pub fn common_ancestor(self, other: DataType) -> DataType {
        let other_chain = other.ancestors();
        self.ancestors()
            .into_iter()
            .find(|candidate| other_chain.contains(candidate))
            .unwrap_or(DataType::String)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DataType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "string" | "text" | "varchar" => Ok(DataType::String),
            "integer" | "int" | "int64" | "bigint" => Ok(DataType::Integer),
            "float" | "double" | "float64" | "double precision" => Ok(DataType::Float),
            "boolean" | "bool" => Ok(DataType::Boolean),
            "timestamp" | "datetime" | "date-time" => Ok(DataType::Timestamp),
            "json" | "jsonb" => Ok(DataType::Json),
            _ => Err(anyhow!(
                "Unknown data type '{value}'. Supported types: {}",
                DataType::variants().join(", ")
            )),
        }
    }
}

impl Serialize for DataType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        DataType::from_str(&token).map_err(|err| de::Error::custom(err.to_string()))
    }
}

/// A column and every type that has been observed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    type_occurrence: BTreeSet<DataType>,
}

impl Column {
    pub fn new(data_type: DataType) -> Self {
        Column {
            type_occurrence: BTreeSet::from([data_type]),
        }
    }

    /// The column's effective type: the common ancestor of all observed types.
    pub fn data_type(&self) -> DataType {
        let mut observed = self.type_occurrence.iter().copied();
        let first = observed.next().unwrap_or(DataType::String);
        observed.fold(first, DataType::common_ancestor)
    }

    pub fn observed_types(&self) -> impl Iterator<Item = DataType> + '_ {
        self.type_occurrence.iter().copied()
    }

    pub fn merge(&mut self, other: &Column) {
        self.type_occurrence
            .extend(other.type_occurrence.iter().copied());
    }
}

impl Serialize for Column {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.data_type().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Column {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        DataType::deserialize(deserializer).map(Column::new)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Columns(BTreeMap<String, Column>);

impl Columns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, column: Column) {
        self.0.insert(name.into(), column);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Column)> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Folds `other` into `self`: unknown columns are added, known columns
    /// accumulate the other side's observed types.
    pub fn merge(&mut self, other: &Columns) {
        for (name, column) in &other.0 {
            match self.0.get_mut(name) {
                Some(existing) => existing.merge(column),
                None => {
                    self.0.insert(name.clone(), column.clone());
                }
            }
        }
    }
}

impl FromIterator<(String, Column)> for Columns {
    fn from_iter<I: IntoIterator<Item = (String, Column)>>(iter: I) -> Self {
        Columns(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub columns: Columns,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub pk_fields: BTreeSet<String>,
}

impl Table {
    pub fn new(name: impl Into<String>, pk_fields: BTreeSet<String>) -> Self {
        Table {
            name: name.into(),
            columns: Columns::new(),
            pk_fields,
        }
    }

    /// A table without columns carries no usable data and must be skipped.
    pub fn exists(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Columns present in `other` but not in `self`, as a table named like `self`.
    pub fn diff(&self, other: &Table) -> Table {
        let columns = other
            .columns
            .iter()
            .filter(|(name, _)| !self.columns.contains(name))
            .map(|(name, column)| (name.clone(), column.clone()))
            .collect();
        Table {
            name: self.name.clone(),
            columns,
            pk_fields: self.pk_fields.clone(),
        }
    }
}

/// Loads destination schemas keyed by table name from a YAML file.
pub fn load_tables(path: &Path) -> Result<BTreeMap<String, Table>> {
    let mut tables: BTreeMap<String, Table> = config::load_from_path(path)
        .with_context(|| format!("Loading destination schemas from {path:?}"))?;
    for (name, table) in tables.iter_mut() {
        if table.name.is_empty() {
            table.name = name.clone();
        }
    }
    Ok(tables)
}
