use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

/// Data as it arrives from outside the pipeline: model output, or columns
/// read back from storage. Some leaves have no JSON form.
#[derive(Debug, Clone, PartialEq)]
pub enum LooseValue {
    Null,
    Bool(bool),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
    List(Vec<LooseValue>),
    Map(BTreeMap<String, LooseValue>),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
    Uuid(Uuid),
}

/// Rebuilds `value` so that it holds only maps, lists and primitives.
///
/// Leaves without a JSON form become their canonical string: RFC 3339 for
/// timestamps, lowercase hex for bytes, hyphenated form for UUIDs, and
/// `NaN`/`inf`/`-inf` for non-finite floats.
pub fn sanitize(value: LooseValue) -> Value {
    match value {
        LooseValue::Null => Value::Null,
        LooseValue::Bool(flag) => Value::Bool(flag),
        LooseValue::Integer(number) => Value::Number(number.into()),
        LooseValue::Unsigned(number) => Value::Number(number.into()),
        LooseValue::Float(number) => match Number::from_f64(number) {
            Some(finite) => Value::Number(finite),
            None => Value::String(number.to_string()),
        },
        LooseValue::Text(text) => Value::String(text),
        LooseValue::List(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        LooseValue::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(key, item)| (key, sanitize(item)))
                .collect(),
        ),
        LooseValue::Timestamp(ts) => Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        LooseValue::Bytes(bytes) => Value::String(hex(&bytes)),
        LooseValue::Uuid(id) => Value::String(id.hyphenated().to_string()),
    }
}

pub fn sanitize_object(object: Map<String, Value>) -> Map<String, Value> {
    match sanitize(LooseValue::from(Value::Object(object))) {
        Value::Object(clean) => clean,
        _ => Map::new(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

impl From<Value> for LooseValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(flag),
            Value::Number(number) => {
                if let Some(signed) = number.as_i64() {
                    Self::Integer(signed)
                } else if let Some(unsigned) = number.as_u64() {
                    Self::Unsigned(unsigned)
                } else {
                    Self::Float(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(text) => Self::Text(text),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(key, item)| (key, Self::from(item)))
                    .collect(),
            ),
        }
    }
}

impl From<rusqlite::types::Value> for LooseValue {
    fn from(value: rusqlite::types::Value) -> Self {
        use rusqlite::types::Value as Column;

        match value {
            Column::Null => Self::Null,
            Column::Integer(number) => Self::Integer(number),
            Column::Real(number) => Self::Float(number),
            Column::Text(text) => Self::Text(text),
            Column::Blob(bytes) => Self::Bytes(bytes),
        }
    }
}

impl From<DateTime<Utc>> for LooseValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Uuid> for LooseValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}
