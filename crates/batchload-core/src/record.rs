use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::value::{CoercionError, KeyValue, Value};

/// Untyped candidate row as produced by an upstream extraction step.
pub type RawRow = serde_json::Map<String, JsonValue>;

/// Ordered primary-key tuple of a row. Equal tuples mean duplicate rows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrimaryKey(Vec<KeyValue>);

impl PrimaryKey {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<KeyValue> for PrimaryKey {
    fn from(value: KeyValue) -> Self {
        Self(vec![value])
    }
}

impl std::fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts = self.0.iter().map(ToString::to_string).collect::<Vec<_>>();
        write!(f, "({})", parts.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("row is missing primary key field `{field}`")]
    Missing { field: String },
    #[error("primary key field `{field}`: {source}")]
    Coercion {
        field: String,
        #[source]
        source: CoercionError,
    },
    #[error("expected {expected} primary key components, got {found}")]
    Arity { expected: usize, found: usize },
}

/// Why a candidate row could not become a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("unknown field `{0}`")]
    UnknownField(String),
    #[error("field `{field}`: {source}")]
    Field {
        field: String,
        #[source]
        source: CoercionError,
    },
}

/// A row validated against an entity definition. Every declared field is
/// present; absent nullable fields hold [`Value::Null`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    values: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.values.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Unpack into a JSON object, with timestamps rendered as RFC 3339.
    pub fn to_json(&self) -> RawRow {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
