//! The Schema Mapper (C4) — the computational heart of the pipeline.
//!
//! Constructed once per pipeline from the stream schemas and sink column
//! mapping (§4.4) and immutable thereafter, so every stage can hold an
//! `Arc<Mapper>` and call into it from any worker without locking.

use crate::config::{ColumnMappingEntry, ColumnType, JoinOrientation, JsonFieldType, StreamSchemaConfig};
use crate::error::{PipelineError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// A single coerced ClickHouse-typed value. Dynamic dispatch on JSON input
/// values is a tagged-variant match (§9); this is the mirror tagged-variant
/// for the *output* side, produced per `ColumnType`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChValue {
    String(String),
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    DateTime(DateTime<Utc>),
    DateTime64(DateTime<Utc>, u8),
    Enum8(String),
    Uuid(String),
    Array(Vec<ChValue>),
}

pub struct Mapper {
    ordered_columns: Vec<ColumnMappingEntry>,
    streams: HashMap<String, StreamSchemaConfig>,
}

impl Mapper {
    pub fn new(streams: Vec<StreamSchemaConfig>, columns: Vec<ColumnMappingEntry>) -> Result<Self> {
        if columns.is_empty() {
            return Err(PipelineError::invalid_input("column mapping must not be empty"));
        }
        let stream_map: HashMap<String, StreamSchemaConfig> =
            streams.into_iter().map(|s| (s.stream_name.clone(), s)).collect();
        Ok(Self {
            ordered_columns: columns,
            streams: stream_map,
        })
    }

    pub fn get_ordered_columns(&self) -> &[ColumnMappingEntry] {
        &self.ordered_columns
    }

    pub fn get_ordered_columns_stream(&self, stream_name: &str) -> Vec<&ColumnMappingEntry> {
        self.ordered_columns
            .iter()
            .filter(|c| c.stream_name == stream_name)
            .collect()
    }

    /// Single-stream case: every mapped column is resolved against one
    /// payload (§4.4).
    pub fn prepare_values(&self, json_bytes: &[u8]) -> Result<Vec<ChValue>> {
        let value: Value = serde_json::from_slice(json_bytes)?;
        self.ordered_columns
            .iter()
            .map(|col| {
                let field_type = self.field_type(&col.stream_name, &col.field_name);
                let resolved = get_path(&value, &col.field_name);
                coerce_value(resolved, &col.field_name, field_type, &col.column_type)
            })
            .collect()
    }

    pub fn prepare_values_stream(&self, stream_name: &str, json_bytes: &[u8]) -> Result<Vec<ChValue>> {
        let value: Value = serde_json::from_slice(json_bytes)?;
        self.get_ordered_columns_stream(stream_name)
            .into_iter()
            .map(|col| {
                let field_type = self.field_type(&col.stream_name, &col.field_name);
                let resolved = get_path(&value, &col.field_name);
                coerce_value(resolved, &col.field_name, field_type, &col.column_type)
            })
            .collect()
    }

    /// Merge fields from both sides of a join into the canonical row
    /// (§4.7). Columns not belonging to either named stream fall back to a
    /// missing-field (zero-equivalent) value.
    pub fn join_data(
        &self,
        left_stream: &str,
        left_bytes: &[u8],
        right_stream: &str,
        right_bytes: &[u8],
    ) -> Result<Vec<ChValue>> {
        let left: Value = serde_json::from_slice(left_bytes)?;
        let right: Value = serde_json::from_slice(right_bytes)?;

        self.ordered_columns
            .iter()
            .map(|col| {
                let field_type = self.field_type(&col.stream_name, &col.field_name);
                let resolved = if col.stream_name == left_stream {
                    get_path(&left, &col.field_name)
                } else if col.stream_name == right_stream {
                    get_path(&right, &col.field_name)
                } else {
                    None
                };
                coerce_value(resolved, &col.field_name, field_type, &col.column_type)
            })
            .collect()
    }

    pub fn get_join_key(&self, stream_name: &str, json_bytes: &[u8]) -> Result<String> {
        let schema = self.streams.get(stream_name).ok_or_else(|| {
            PipelineError::invalid_input(format!("unknown stream {stream_name}"))
        })?;
        let key_field = schema.join_key_field.as_ref().ok_or_else(|| {
            PipelineError::invalid_input(format!("stream {stream_name} has no join_key_field"))
        })?;
        self.get_key(stream_name, key_field, json_bytes)
    }

    pub fn get_key(&self, _stream_name: &str, field_name: &str, json_bytes: &[u8]) -> Result<String> {
        let value: Value = serde_json::from_slice(json_bytes)?;
        let resolved = get_path(&value, field_name).ok_or_else(|| {
            PipelineError::permanent(format!("key field {field_name} missing or null"))
        })?;
        value_to_key_string(resolved)
            .ok_or_else(|| PipelineError::permanent(format!("key field {field_name} is not scalar")))
    }

    pub fn get_fields_map(&self, stream_name: &str, json_bytes: &[u8]) -> Result<HashMap<String, Value>> {
        let value: Value = serde_json::from_slice(json_bytes)?;
        let schema = self.streams.get(stream_name).ok_or_else(|| {
            PipelineError::invalid_input(format!("unknown stream {stream_name}"))
        })?;
        let mut out = HashMap::new();
        for field in &schema.fields {
            if let Some(v) = get_path(&value, &field.field_name) {
                out.insert(field.field_name.clone(), v.clone());
            }
        }
        Ok(out)
    }

    pub fn validate_schema(&self, stream_name: &str, json_bytes: &[u8]) -> Result<()> {
        let value: Value = serde_json::from_slice(json_bytes)?;
        if !value.is_object() {
            return Err(PipelineError::permanent(format!(
                "stream {stream_name} payload is not a JSON object"
            )));
        }
        Ok(())
    }

    pub fn join_orientation(&self, stream_name: &str) -> Option<JoinOrientation> {
        self.streams.get(stream_name).and_then(|s| s.join_orientation)
    }

    fn field_type(&self, stream_name: &str, field_name: &str) -> Option<JsonFieldType> {
        self.streams
            .get(stream_name)
            .and_then(|s| s.fields.iter().find(|f| f.field_name == field_name))
            .map(|f| f.field_type)
    }
}

fn value_to_key_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------
// Dotted / bracket field-path resolution
// ---------------------------------------------------------------------

enum PathSeg {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Vec<PathSeg> {
    let mut segs = Vec::new();
    for part in path.split('.') {
        let mut key = String::new();
        let mut chars = part.chars().peekable();
        while let Some(&c) = chars.peek() {
            if c == '[' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if !key.is_empty() {
            segs.push(PathSeg::Key(key));
        }
        let mut in_bracket = false;
        let mut idx = String::new();
        for c in chars {
            match c {
                '[' => {
                    in_bracket = true;
                    idx.clear();
                }
                ']' => {
                    in_bracket = false;
                    if let Ok(i) = idx.parse::<usize>() {
                        segs.push(PathSeg::Index(i));
                    }
                }
                _ if in_bracket => idx.push(c),
                _ => {}
            }
        }
    }
    segs
}

fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for seg in parse_path(path) {
        current = match seg {
            PathSeg::Key(k) => current.get(&k)?,
            PathSeg::Index(i) => current.as_array()?.get(i)?,
        };
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

// ---------------------------------------------------------------------
// Coercion (§4.4)
// ---------------------------------------------------------------------

const DATETIME_LAYOUTS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%a, %d %b %Y %H:%M:%S %z",
    "%a, %d %b %Y %H:%M:%S GMT",
    "%A, %d-%b-%y %H:%M:%S GMT",
    "%a %b %e %H:%M:%S %Y",
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%d.%m.%Y",
    "%m.%d.%Y",
    "%Y/%m/%d",
    "%b %e, %Y",
    "%e %b %Y",
];

fn coerce_value(
    value: Option<&Value>,
    field_name: &str,
    json_field_type: Option<JsonFieldType>,
    target: &ColumnType,
) -> Result<ChValue> {
    match target {
        ColumnType::String => Ok(ChValue::String(coerce_string(value))),
        ColumnType::Bool => coerce_bool(value, field_name),
        ColumnType::Int8 => coerce_signed(value, field_name, json_field_type, i8::MIN as i64, i8::MAX as i64)
            .map(|v| ChValue::Int8(v as i8)),
        ColumnType::Int16 => coerce_signed(value, field_name, json_field_type, i16::MIN as i64, i16::MAX as i64)
            .map(|v| ChValue::Int16(v as i16)),
        ColumnType::Int32 => coerce_signed(value, field_name, json_field_type, i32::MIN as i64, i32::MAX as i64)
            .map(|v| ChValue::Int32(v as i32)),
        ColumnType::Int64 => {
            coerce_signed(value, field_name, json_field_type, i64::MIN, i64::MAX).map(ChValue::Int64)
        }
        ColumnType::UInt8 => coerce_unsigned(value, field_name, u8::MAX as u64).map(|v| ChValue::UInt8(v as u8)),
        ColumnType::UInt16 => {
            coerce_unsigned(value, field_name, u16::MAX as u64).map(|v| ChValue::UInt16(v as u16))
        }
        ColumnType::UInt32 => {
            coerce_unsigned(value, field_name, u32::MAX as u64).map(|v| ChValue::UInt32(v as u32))
        }
        ColumnType::UInt64 => coerce_unsigned(value, field_name, u64::MAX).map(ChValue::UInt64),
        ColumnType::Float32 => coerce_float(value, field_name).map(|f| ChValue::Float32(f as f32)),
        ColumnType::Float64 => coerce_float(value, field_name).map(ChValue::Float64),
        ColumnType::DateTime => coerce_datetime(value, field_name, 0).map(ChValue::DateTime),
        ColumnType::DateTime64 { precision } => {
            coerce_datetime(value, field_name, *precision).map(|dt| ChValue::DateTime64(dt, *precision))
        }
        ColumnType::Enum8 => Ok(ChValue::Enum8(coerce_string(value))),
        ColumnType::Uuid => Ok(ChValue::Uuid(coerce_string(value))),
        ColumnType::Array { element } => coerce_array(value, field_name, element),
    }
}

fn coerce_string(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn coerce_bool(value: Option<&Value>, field_name: &str) -> Result<ChValue> {
    match value {
        None | Some(Value::Null) => Ok(ChValue::Bool(false)),
        Some(Value::Bool(b)) => Ok(ChValue::Bool(*b)),
        Some(other) => Err(coercion_err(field_name, other, "Bool")),
    }
}

fn coerce_signed(
    value: Option<&Value>,
    field_name: &str,
    json_field_type: Option<JsonFieldType>,
    min: i64,
    max: i64,
) -> Result<i64> {
    let n = match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i
            } else if let Some(f) = n.as_f64() {
                if f.fract() != 0.0 {
                    return Err(coercion_err(field_name, value.unwrap(), "Int"));
                }
                f as i64
            } else {
                return Err(coercion_err(field_name, value.unwrap(), "Int"));
            }
        }
        // numeric strings rejected for signed types unless explicitly string-typed (Design Note c)
        Some(Value::String(s)) if json_field_type == Some(JsonFieldType::String) => s
            .parse::<i64>()
            .map_err(|_| coercion_err(field_name, value.unwrap(), "Int"))?,
        Some(other) => return Err(coercion_err(field_name, other, "Int")),
    };
    if n < min || n > max {
        return Err(PipelineError::OutOfRange {
            field: field_name.to_string(),
            value: n.to_string(),
            target_type: "Int",
        });
    }
    Ok(n)
}

fn coerce_unsigned(value: Option<&Value>, field_name: &str, max: u64) -> Result<u64> {
    let n = match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(n)) => {
            if let Some(u) = n.as_u64() {
                u
            } else if let Some(f) = n.as_f64() {
                if f.fract() != 0.0 || f < 0.0 {
                    return Err(coercion_err(field_name, value.unwrap(), "UInt"));
                }
                f as u64
            } else {
                return Err(coercion_err(field_name, value.unwrap(), "UInt"));
            }
        }
        // numeric strings accepted for unsigned types (Design Note c)
        Some(Value::String(s)) => s
            .parse::<u64>()
            .map_err(|_| coercion_err(field_name, value.unwrap(), "UInt"))?,
        Some(other) => return Err(coercion_err(field_name, other, "UInt")),
    };
    if n > max {
        return Err(PipelineError::OutOfRange {
            field: field_name.to_string(),
            value: n.to_string(),
            target_type: "UInt",
        });
    }
    Ok(n)
}

fn coerce_float(value: Option<&Value>, field_name: &str) -> Result<f64> {
    match value {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| coercion_err(field_name, value.unwrap(), "Float")),
        Some(other) => Err(coercion_err(field_name, other, "Float")),
    }
}

fn coerce_datetime(value: Option<&Value>, field_name: &str, precision: u8) -> Result<DateTime<Utc>> {
    match value {
        None | Some(Value::Null) => Ok(Utc.timestamp_opt(0, 0).unwrap()),
        Some(Value::Number(n)) => {
            if precision > 0 {
                let secs = n.as_f64().ok_or_else(|| coercion_err(field_name, value.unwrap(), "DateTime64"))?;
                if secs < 0.0 {
                    return Err(coercion_err(field_name, value.unwrap(), "DateTime64"));
                }
                let whole = secs.trunc() as i64;
                let nanos = ((secs.fract()) * 1_000_000_000.0).round() as u32;
                Ok(Utc.timestamp_opt(whole, nanos).single().ok_or_else(|| {
                    coercion_err(field_name, value.unwrap(), "DateTime64")
                })?)
            } else {
                let secs = n
                    .as_i64()
                    .ok_or_else(|| coercion_err(field_name, value.unwrap(), "DateTime"))?;
                if secs < 0 {
                    return Err(coercion_err(field_name, value.unwrap(), "DateTime"));
                }
                Ok(Utc
                    .timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| coercion_err(field_name, value.unwrap(), "DateTime"))?)
            }
        }
        Some(Value::String(s)) => parse_datetime_string(s)
            .ok_or_else(|| coercion_err(field_name, value.unwrap(), "DateTime")),
        Some(other) => Err(coercion_err(field_name, other, "DateTime")),
    }
}

fn parse_datetime_string(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for layout in DATETIME_LAYOUTS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, layout) {
            return Some(Utc.from_utc_datetime(&dt));
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, layout) {
            return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap()));
        }
    }
    None
}

fn coerce_array(value: Option<&Value>, field_name: &str, element: &ColumnType) -> Result<ChValue> {
    match value {
        None | Some(Value::Null) => Ok(ChValue::Array(Vec::new())),
        Some(Value::Array(items)) => {
            let coerced = items
                .iter()
                .map(|item| coerce_value(Some(item), field_name, None, element))
                .collect::<Result<Vec<_>>>()?;
            Ok(ChValue::Array(coerced))
        }
        Some(other) => Err(coercion_err(field_name, other, "Array")),
    }
}

fn coercion_err(field_name: &str, value: &Value, target: &'static str) -> PipelineError {
    PipelineError::Coercion {
        field: field_name.to_string(),
        value: value.to_string(),
        observed_type: json_type_name(value),
        reason: format!("cannot coerce to {target}"),
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
