//! Destination table schema model and the schema resolver.
//!
//! A [`TableSchema`] is the ordered list of [`SchemaField`]s of a warehouse
//! table. It is fetched once per run and fixes the column order and count of
//! every load. Schema files use the warehouse's JSON layout
//! (`[{"name": ..., "type": ..., "mode": ..., "description": ...}]`) and may
//! also be written as YAML.

use std::{
    fmt,
    fs::File,
    io::BufReader,
    path::Path,
    str::FromStr,
};

use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::{
    error::IngestError,
    warehouse::{TableRef, Warehouse},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Date,
    Timestamp,
    Bool,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "STRING",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Date => "DATE",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Bool => "BOOLEAN",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "STRING" | "TEXT" => Ok(FieldType::Text),
            "INTEGER" | "INT64" | "INT" => Ok(FieldType::Integer),
            "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => Ok(FieldType::Float),
            "DATE" => Ok(FieldType::Date),
            "TIMESTAMP" | "DATETIME" => Ok(FieldType::Timestamp),
            "BOOL" | "BOOLEAN" => Ok(FieldType::Bool),
            _ => Err(anyhow!("Unsupported field type '{value}'")),
        }
    }
}

impl Serialize for FieldType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        FieldType::from_str(&token).map_err(|err| de::Error::custom(err.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.mode = FieldMode::Required;
        self
    }

    pub fn is_required(&self) -> bool {
        self.mode == FieldMode::Required
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSchema {
    pub fields: Vec<SchemaField>,
}

impl TableSchema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Loads a schema file; `.json` is parsed as JSON, anything else as YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening schema file {path:?}"))?;
        let reader = BufReader::new(file);
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let schema: TableSchema = if is_json {
            serde_json::from_reader(reader).context("Parsing schema JSON")?
        } else {
            serde_yaml::from_reader(reader).context("Parsing schema YAML")?
        };
        schema.validate()?;
        Ok(schema)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Creating schema file {path:?}"))?;
        serde_json::to_writer_pretty(file, self).context("Writing schema JSON")
    }

    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(anyhow!("Schema defines no fields"));
        }
        for (idx, field) in self.fields.iter().enumerate() {
            if field.name.trim().is_empty() {
                return Err(anyhow!("Schema field at position {} has an empty name", idx + 1));
            }
            if self.fields[..idx].iter().any(|f| f.name == field.name) {
                return Err(anyhow!("Schema field '{}' is declared twice", field.name));
            }
        }
        Ok(())
    }
}

/// Outcome of schema resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedSchema {
    Known(TableSchema),
    /// The destination does not exist yet; the load asks the warehouse to autodetect.
    Unknown,
}

impl ResolvedSchema {
    pub fn as_known(&self) -> Option<&TableSchema> {
        match self {
            ResolvedSchema::Known(schema) => Some(schema),
            ResolvedSchema::Unknown => None,
        }
    }
}

/// Fetches the destination schema. A missing table is not an error.
pub fn resolve(
    warehouse: &dyn Warehouse,
    table: &TableRef,
) -> std::result::Result<ResolvedSchema, IngestError> {
    match warehouse.get_table(table)? {
        Some(info) => {
            info!(
                "Resolved schema for {} ({} field(s), {} row(s))",
                table,
                info.schema.len(),
                info.num_rows
            );
            Ok(ResolvedSchema::Known(info.schema))
        }
        None => {
            debug!("Table {table} does not exist; schema will be autodetected");
            Ok(ResolvedSchema::Unknown)
        }
    }
}
