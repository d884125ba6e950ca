use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value as JsonValue};
use thiserror::Error;

/// Column primitive types understood by the loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Integer,
    Float,
    Boolean,
    Text {
        #[serde(default)]
        max_length: Option<usize>,
    },
    Timestamp,
    Json,
}

/// A typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(JsonValue),
}

/// A single primary-key component. Only types with total equality can be keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyValue {
    Integer(i64),
    Boolean(bool),
    Text(String),
    Timestamp(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoercionError {
    #[error("expected {expected}, got {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("null is not allowed")]
    NullNotAllowed,
}

impl FieldKind {
    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Boolean => "boolean",
            FieldKind::Text { .. } => "text",
            FieldKind::Timestamp => "timestamp",
            FieldKind::Json => "json",
        }
    }

    pub fn can_be_key(&self) -> bool {
        !matches!(self, FieldKind::Float | FieldKind::Json)
    }

    /// Cast a raw JSON value into this column type.
    ///
    /// Over-length text is silently truncated to `max_length` characters.
    /// `null` always coerces to [`Value::Null`]; nullability is checked by the
    /// owning field definition.
    pub fn coerce(&self, raw: &JsonValue) -> Result<Value, CoercionError> {
        if raw.is_null() {
            return Ok(Value::Null);
        }
        match self {
            FieldKind::Integer => coerce_integer(raw).map(Value::Integer),
            FieldKind::Float => coerce_float(raw).map(Value::Float),
            FieldKind::Boolean => coerce_boolean(raw).map(Value::Boolean),
            FieldKind::Text { max_length } => coerce_text(raw, *max_length).map(Value::Text),
            FieldKind::Timestamp => coerce_timestamp(raw).map(Value::Timestamp),
            FieldKind::Json => Ok(Value::Json(raw.clone())),
        }
    }

    pub fn coerce_key(&self, raw: &JsonValue) -> Result<KeyValue, CoercionError> {
        match self.coerce(raw)? {
            Value::Null => Err(CoercionError::NullNotAllowed),
            value => value.as_key().ok_or_else(|| mismatch(self.label(), raw)),
        }
    }
}

fn mismatch(expected: &'static str, raw: &JsonValue) -> CoercionError {
    let mut found = raw.to_string();
    if found.chars().count() > 64 {
        found = found.chars().take(61).collect::<String>() + "...";
    }
    CoercionError::TypeMismatch { expected, found }
}

// Exact powers of two; `i64::MAX as f64` rounds up to 2^63.
const I64_LOWER: f64 = -9_223_372_036_854_775_808.0;
const I64_UPPER: f64 = 9_223_372_036_854_775_808.0;

fn coerce_integer(raw: &JsonValue) -> Result<i64, CoercionError> {
    match raw {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= I64_LOWER && *f < I64_UPPER)
                    .map(|f| f as i64)
            })
            .ok_or_else(|| mismatch("integer", raw)),
        JsonValue::String(s) => s.trim().parse().map_err(|_| mismatch("integer", raw)),
        _ => Err(mismatch("integer", raw)),
    }
}

fn coerce_float(raw: &JsonValue) -> Result<f64, CoercionError> {
    match raw {
        JsonValue::Number(n) => n.as_f64().ok_or_else(|| mismatch("float", raw)),
        JsonValue::String(s) => s.trim().parse().map_err(|_| mismatch("float", raw)),
        _ => Err(mismatch("float", raw)),
    }
}

fn coerce_boolean(raw: &JsonValue) -> Result<bool, CoercionError> {
    match raw {
        JsonValue::Bool(b) => Ok(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(mismatch("boolean", raw)),
        },
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "1" => Ok(true),
            "false" | "f" | "no" | "0" => Ok(false),
            _ => Err(mismatch("boolean", raw)),
        },
        _ => Err(mismatch("boolean", raw)),
    }
}

fn coerce_text(raw: &JsonValue, max_length: Option<usize>) -> Result<String, CoercionError> {
    let text = match raw {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => return Err(mismatch("text", raw)),
    };
    Ok(match max_length {
        Some(max) if text.chars().count() > max => text.chars().take(max).collect(),
        _ => text,
    })
}

fn coerce_timestamp(raw: &JsonValue) -> Result<DateTime<Utc>, CoercionError> {
    match raw {
        JsonValue::String(s) => parse_timestamp(s.trim()).ok_or_else(|| mismatch("timestamp", raw)),
        JsonValue::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| mismatch("timestamp", raw)),
        _ => Err(mismatch("timestamp", raw)),
    }
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_key(&self) -> Option<KeyValue> {
        match self {
            Value::Integer(v) => Some(KeyValue::Integer(*v)),
            Value::Boolean(v) => Some(KeyValue::Boolean(*v)),
            Value::Text(v) => Some(KeyValue::Text(v.clone())),
            Value::Timestamp(v) => Some(KeyValue::Timestamp(*v)),
            Value::Null | Value::Float(_) | Value::Json(_) => None,
        }
    }

    /// JSON rendering used for dumps; timestamps become RFC 3339 strings.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Integer(v) => JsonValue::from(*v),
            Value::Float(v) => Number::from_f64(*v).map(JsonValue::Number).unwrap_or(JsonValue::Null),
            Value::Boolean(v) => JsonValue::Bool(*v),
            Value::Text(v) => JsonValue::String(v.clone()),
            Value::Timestamp(v) => JsonValue::String(v.to_rfc3339()),
            Value::Json(v) => v.clone(),
        }
    }
}

impl From<KeyValue> for Value {
    fn from(key: KeyValue) -> Self {
        match key {
            KeyValue::Integer(v) => Value::Integer(v),
            KeyValue::Boolean(v) => Value::Boolean(v),
            KeyValue::Text(v) => Value::Text(v),
            KeyValue::Timestamp(v) => Value::Timestamp(v),
        }
    }
}

impl std::fmt::Display for KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyValue::Integer(v) => write!(f, "{v}"),
            KeyValue::Boolean(v) => write!(f, "{v}"),
            KeyValue::Text(v) => write!(f, "{v}"),
            KeyValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_longer_than_column_is_truncated() {
        let kind = FieldKind::Text { max_length: Some(5) };
        assert_eq!(kind.coerce(&json!("abcdefgh")).unwrap(), Value::Text("abcde".into()));
        assert_eq!(kind.coerce(&json!("abc")).unwrap(), Value::Text("abc".into()));
        // characters, not bytes
        assert_eq!(kind.coerce(&json!("ééééééé")).unwrap(), Value::Text("ééééé".into()));
    }

    #[test]
    fn numeric_keys_are_rendered_as_text() {
        let kind = FieldKind::Text { max_length: None };
        assert_eq!(kind.coerce_key(&json!(1234)).unwrap(), KeyValue::Text("1234".into()));
    }

    #[test]
    fn integer_coercion_accepts_whole_floats_and_strings() {
        assert_eq!(FieldKind::Integer.coerce(&json!(12.0)).unwrap(), Value::Integer(12));
        assert_eq!(FieldKind::Integer.coerce(&json!(" 42 ")).unwrap(), Value::Integer(42));
        assert!(FieldKind::Integer.coerce(&json!(1.5)).is_err());
        assert!(FieldKind::Integer.coerce(&json!("forty")).is_err());
        assert!(FieldKind::Integer.coerce(&json!([1])).is_err());
    }

    #[test]
    fn integers_outside_i64_are_rejected() {
        assert!(FieldKind::Integer.coerce(&json!(9_223_372_036_854_775_808.0)).is_err());
        assert!(FieldKind::Integer.coerce(&json!(9_223_372_036_854_775_808u64)).is_err());
        assert!(FieldKind::Integer.coerce(&json!(u64::MAX)).is_err());
        assert!(FieldKind::Integer.coerce(&json!(1e300)).is_err());
        assert_eq!(
            FieldKind::Integer.coerce(&json!(-9_223_372_036_854_775_808.0)).unwrap(),
            Value::Integer(i64::MIN)
        );
        assert_eq!(
            FieldKind::Integer.coerce(&json!(i64::MAX)).unwrap(),
            Value::Integer(i64::MAX)
        );
        assert!(FieldKind::Integer
            .coerce_key(&json!(9_223_372_036_854_775_809u64))
            .is_err());
    }

    #[test]
    fn boolean_coercion_accepts_common_spellings() {
        assert_eq!(FieldKind::Boolean.coerce(&json!("Yes")).unwrap(), Value::Boolean(true));
        assert_eq!(FieldKind::Boolean.coerce(&json!(0)).unwrap(), Value::Boolean(false));
        assert!(FieldKind::Boolean.coerce(&json!(2)).is_err());
    }

    #[test]
    fn timestamps_parse_from_several_layouts() {
        let expected = Utc.with_ymd_and_hms(2019, 3, 1, 10, 30, 0).single().unwrap();
        for raw in [
            json!("2019-03-01T10:30:00Z"),
            json!("2019-03-01T11:30:00+01:00"),
            json!("2019-03-01 10:30:00"),
            json!("2019-03-01T10:30:00"),
            json!(expected.timestamp()),
        ] {
            assert_eq!(FieldKind::Timestamp.coerce(&raw).unwrap(), Value::Timestamp(expected), "{raw}");
        }
        let midnight = Utc.with_ymd_and_hms(2019, 3, 1, 0, 0, 0).single().unwrap();
        assert_eq!(FieldKind::Timestamp.coerce(&json!("2019-03-01")).unwrap(), Value::Timestamp(midnight));
        assert!(FieldKind::Timestamp.coerce(&json!("last tuesday")).is_err());
    }

    #[test]
    fn null_key_component_is_rejected() {
        assert_eq!(
            FieldKind::Integer.coerce_key(&JsonValue::Null),
            Err(CoercionError::NullNotAllowed)
        );
    }

    #[test]
    fn timestamps_render_as_rfc3339() {
        let ts = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).single().unwrap();
        assert_eq!(Value::Timestamp(ts).to_json(), json!("2020-01-02T03:04:05+00:00"));
        assert_eq!(Value::Float(f64::NAN).to_json(), JsonValue::Null);
    }
}
