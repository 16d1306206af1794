use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One extracted record: field name to value
///
/// Empty values are treated the same as absent ones, so a record survives a
/// trip through a CSV file (which cannot tell the two apart) unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, String>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a record from `(field, value)` pairs
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut record = Self::new();
        for (field, value) in pairs {
            record.set(field, value);
        }
        record
    }

    /// Sets a field; an empty value removes it
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        let field = field.into();
        let value = value.into();
        if value.is_empty() {
            self.fields.remove(&field);
        } else {
            self.fields.insert(field, value);
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// The value of the key field, if present
    pub fn key(&self, key_field: &str) -> Option<&str> {
        self.get(key_field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<BTreeMap<String, String>> for Record {
    fn from(fields: BTreeMap<String, String>) -> Self {
        Self::from_pairs(fields)
    }
}

/// An ordered collection of records plus its column layout
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    /// Column order used when the dataset is written out
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

impl Dataset {
    pub fn new(columns: Vec<String>, rows: Vec<Record>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct key values present in the dataset
    pub fn keys(&self, key_field: &str) -> HashSet<String> {
        self.rows
            .iter()
            .filter_map(|row| row.key(key_field))
            .map(str::to_string)
            .collect()
    }

    /// Adds any column of `record` not yet known, keeping first-seen order
    pub(crate) fn extend_columns(&mut self, record: &Record) {
        for (field, _) in record.fields() {
            if !self.columns.iter().any(|c| c == field) {
                self.columns.push(field.to_string());
            }
        }
    }

    /// Moves `key_field` to the front of the column list
    pub(crate) fn key_column_first(&mut self, key_field: &str) {
        self.columns.retain(|c| c != key_field);
        self.columns.insert(0, key_field.to_string());
    }
}
