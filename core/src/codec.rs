//! Typed JSON codec for the vendor wire format.
//!
//! # Design
//! The vendor transmits rich values as JSON objects tagged with a
//! `__class__` discriminator. `Value` is the decoded tree; `Codec` holds the
//! decoder registry keyed by tag and walks arbitrary JSON bottom-up. Objects
//! with an unknown tag (or none) stay plain maps, so new server-side kinds
//! degrade gracefully instead of failing the whole payload. Encoding is the
//! exact inverse and is infallible.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use rust_decimal::Decimal;
use serde_json::json;

use crate::error::CodecError;
use crate::task::TaskRef;

/// String-keyed map of decoded values, in deterministic key order.
pub type ValueMap = BTreeMap<String, Value>;

/// A decoded wire value.
///
/// Plain JSON shapes (null, bool, numbers, strings, arrays, objects) map
/// one-to-one; tagged envelopes become the rich variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Decimal(Decimal),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    Duration(TimeDelta),
    Bytes(Vec<u8>),
    Reference(Reference),
    Task(TaskRef),
    List(Vec<Value>),
    Map(ValueMap),
}

/// Reference to a remote record: entity type, id, and display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub model_name: String,
    pub id: i64,
    pub rec_name: Option<String>,
}

impl Value {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(data.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(d) => Some(*d),
            Value::Int(n) => Some(Decimal::from(*n)),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Value::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Decimal(_) => "decimal",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::DateTime(_) => "datetime",
            Value::Duration(_) => "duration",
            Value::Bytes(_) => "bytes",
            Value::Reference(_) => "reference",
            Value::Task(_) => "task",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Value {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::String(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Value {
        Value::Decimal(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Value {
        Value::Date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Value {
        Value::Time(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Value {
        Value::DateTime(v)
    }
}

impl From<TimeDelta> for Value {
    fn from(v: TimeDelta) -> Value {
        Value::Duration(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::List(v)
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Value {
        Value::Map(v)
    }
}

/// Encode a value tree into vendor wire JSON.
pub fn encode(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(n) => json!(n),
        Value::Float(f) => json!(f),
        Value::String(s) => json!(s),
        Value::Decimal(d) => json!({
            "__class__": "Decimal",
            "decimal": d.to_string(),
        }),
        Value::Date(d) => json!({
            "__class__": "date",
            "year": d.year(),
            "month": d.month(),
            "day": d.day(),
            "iso_string": d.format("%Y-%m-%d").to_string(),
        }),
        Value::Time(t) => json!({
            "__class__": "time",
            "hour": t.hour(),
            "minute": t.minute(),
            "second": t.second(),
            "microsecond": t.nanosecond() / 1_000,
        }),
        Value::DateTime(dt) => {
            let micro = dt.time().nanosecond() / 1_000;
            json!({
                "__class__": "datetime",
                "year": dt.year(),
                "month": dt.month(),
                "day": dt.day(),
                "hour": dt.hour(),
                "minute": dt.minute(),
                "second": dt.second(),
                "microsecond": micro,
                "iso_string": iso_datetime(dt),
            })
        }
        Value::Duration(td) => json!({
            "__class__": "timedelta",
            "seconds": total_seconds(td),
        }),
        Value::Bytes(data) => json!({
            "__class__": "bytes",
            "base64": BASE64.encode(data),
        }),
        Value::Reference(r) => json!({
            "__class__": "Model",
            "model_name": r.model_name,
            "id": r.id,
            "rec_name": r.rec_name,
        }),
        Value::Task(t) => json!({
            "__class__": "AsyncResult",
            "task_id": t.task_id,
            "token": t.token,
        }),
        Value::List(items) => serde_json::Value::Array(items.iter().map(encode).collect()),
        Value::Map(map) => {
            let mut out = serde_json::Map::new();
            for (key, val) in map {
                out.insert(key.clone(), encode(val));
            }
            serde_json::Value::Object(out)
        }
    }
}

/// Encode straight to a JSON string.
pub fn encode_to_string(value: &Value) -> String {
    encode(value).to_string()
}

/// ISO-8601 without a timezone; the fractional part is dropped when the
/// microsecond component is zero, matching the vendor's rendering.
fn iso_datetime(dt: &NaiveDateTime) -> String {
    let micro = dt.time().nanosecond() / 1_000;
    let base = dt.format("%Y-%m-%dT%H:%M:%S").to_string();
    if micro == 0 {
        base
    } else {
        format!("{base}.{micro:06}")
    }
}

fn total_seconds(td: &TimeDelta) -> f64 {
    match td.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => td.num_seconds() as f64,
    }
}

type DecodeFn = fn(&serde_json::Map<String, serde_json::Value>) -> Result<Value, CodecError>;

/// Tag-dispatched decoder registry.
///
/// `Codec::default()` knows every vendor kind; `register` extends it with
/// custom kinds and refuses duplicates so collisions surface at startup.
#[derive(Debug, Clone)]
pub struct Codec {
    decoders: BTreeMap<String, DecodeFn>,
}

impl Default for Codec {
    fn default() -> Self {
        let mut decoders: BTreeMap<String, DecodeFn> = BTreeMap::new();
        decoders.insert("datetime".to_string(), decode_datetime);
        decoders.insert("date".to_string(), decode_date);
        decoders.insert("time".to_string(), decode_time);
        decoders.insert("timedelta".to_string(), decode_timedelta);
        decoders.insert("bytes".to_string(), decode_bytes);
        decoders.insert("Decimal".to_string(), decode_decimal);
        decoders.insert("Model".to_string(), decode_reference);
        decoders.insert("AsyncResult".to_string(), decode_task);
        Codec { decoders }
    }
}

impl Codec {
    /// Registry with no kinds at all; envelopes pass through as plain maps.
    pub fn empty() -> Self {
        Codec {
            decoders: BTreeMap::new(),
        }
    }

    /// Register a decoder for a `__class__` kind.
    pub fn register(&mut self, kind: &str, decoder: DecodeFn) -> Result<(), CodecError> {
        if self.decoders.contains_key(kind) {
            return Err(CodecError::DuplicateKind(kind.to_string()));
        }
        self.decoders.insert(kind.to_string(), decoder);
        Ok(())
    }

    /// Decode arbitrary wire JSON into a value tree.
    pub fn decode(&self, json: &serde_json::Value) -> Result<Value, CodecError> {
        match json {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => Ok(decode_number(n)),
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            serde_json::Value::Array(items) => {
                let decoded = items
                    .iter()
                    .map(|item| self.decode(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::List(decoded))
            }
            serde_json::Value::Object(map) => {
                if let Some(serde_json::Value::String(kind)) = map.get("__class__") {
                    if let Some(decoder) = self.decoders.get(kind.as_str()) {
                        return decoder(map);
                    }
                }
                let mut decoded = ValueMap::new();
                for (key, val) in map {
                    decoded.insert(key.clone(), self.decode(val)?);
                }
                Ok(Value::Map(decoded))
            }
        }
    }

    /// Decode a JSON document from text.
    pub fn decode_str(&self, text: &str) -> Result<Value, CodecError> {
        let json: serde_json::Value = serde_json::from_str(text)?;
        self.decode(&json)
    }
}

fn decode_number(n: &serde_json::Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Int(i)
    } else {
        Value::Float(n.as_f64().unwrap_or(f64::MAX))
    }
}

fn get_u32(
    map: &serde_json::Map<String, serde_json::Value>,
    kind: &str,
    field: &str,
) -> Result<u32, CodecError> {
    map.get(field)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| CodecError::malformed(kind, format!("missing or invalid '{field}'")))
}

fn get_i64(
    map: &serde_json::Map<String, serde_json::Value>,
    kind: &str,
    field: &str,
) -> Result<i64, CodecError> {
    map.get(field)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| CodecError::malformed(kind, format!("missing or invalid '{field}'")))
}

fn get_str<'a>(
    map: &'a serde_json::Map<String, serde_json::Value>,
    kind: &str,
    field: &str,
) -> Result<&'a str, CodecError> {
    map.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| CodecError::malformed(kind, format!("missing or invalid '{field}'")))
}

fn decode_date_parts(
    map: &serde_json::Map<String, serde_json::Value>,
    kind: &str,
) -> Result<NaiveDate, CodecError> {
    let year = get_i64(map, kind, "year")? as i32;
    let month = get_u32(map, kind, "month")?;
    let day = get_u32(map, kind, "day")?;
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| CodecError::malformed(kind, format!("invalid date {year}-{month}-{day}")))
}

fn decode_time_parts(
    map: &serde_json::Map<String, serde_json::Value>,
    kind: &str,
) -> Result<NaiveTime, CodecError> {
    let hour = get_u32(map, kind, "hour")?;
    let minute = get_u32(map, kind, "minute")?;
    let second = get_u32(map, kind, "second")?;
    let micro = get_u32(map, kind, "microsecond")?;
    NaiveTime::from_hms_micro_opt(hour, minute, second, micro).ok_or_else(|| {
        CodecError::malformed(kind, format!("invalid time {hour}:{minute}:{second}.{micro}"))
    })
}

fn decode_datetime(map: &serde_json::Map<String, serde_json::Value>) -> Result<Value, CodecError> {
    let date = decode_date_parts(map, "datetime")?;
    let time = decode_time_parts(map, "datetime")?;
    Ok(Value::DateTime(NaiveDateTime::new(date, time)))
}

fn decode_date(map: &serde_json::Map<String, serde_json::Value>) -> Result<Value, CodecError> {
    Ok(Value::Date(decode_date_parts(map, "date")?))
}

fn decode_time(map: &serde_json::Map<String, serde_json::Value>) -> Result<Value, CodecError> {
    Ok(Value::Time(decode_time_parts(map, "time")?))
}

fn decode_timedelta(map: &serde_json::Map<String, serde_json::Value>) -> Result<Value, CodecError> {
    let seconds = map
        .get("seconds")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| CodecError::malformed("timedelta", "missing or invalid 'seconds'"))?;
    Ok(Value::Duration(TimeDelta::nanoseconds(
        (seconds * 1e9).round() as i64,
    )))
}

fn decode_bytes(map: &serde_json::Map<String, serde_json::Value>) -> Result<Value, CodecError> {
    let text = get_str(map, "bytes", "base64")?;
    let data = BASE64
        .decode(text.trim())
        .map_err(|e| CodecError::malformed("bytes", e.to_string()))?;
    Ok(Value::Bytes(data))
}

fn decode_decimal(map: &serde_json::Map<String, serde_json::Value>) -> Result<Value, CodecError> {
    let text = get_str(map, "Decimal", "decimal")?;
    let decimal = text
        .parse::<Decimal>()
        .map_err(|e| CodecError::malformed("Decimal", e.to_string()))?;
    Ok(Value::Decimal(decimal))
}

fn decode_reference(map: &serde_json::Map<String, serde_json::Value>) -> Result<Value, CodecError> {
    let model_name = get_str(map, "Model", "model_name")?.to_string();
    let id = get_i64(map, "Model", "id")?;
    let rec_name = map
        .get("rec_name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Ok(Value::Reference(Reference {
        model_name,
        id,
        rec_name,
    }))
}

fn decode_task(map: &serde_json::Map<String, serde_json::Value>) -> Result<Value, CodecError> {
    let task_id = get_str(map, "AsyncResult", "task_id")?.to_string();
    let token = get_str(map, "AsyncResult", "token")?.to_string();
    Ok(Value::Task(TaskRef { task_id, token }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) -> Value {
        let codec = Codec::default();
        codec.decode(&encode(&value)).unwrap()
    }

    #[test]
    fn decimal_roundtrips_with_exact_scale() {
        let value = Value::Decimal("42.50".parse().unwrap());
        let wire = encode(&value);
        assert_eq!(wire["__class__"], "Decimal");
        assert_eq!(wire["decimal"], "42.50");
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn date_roundtrips() {
        let value = Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        let wire = encode(&value);
        assert_eq!(wire["iso_string"], "2024-02-29");
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn time_roundtrips() {
        let value = Value::Time(NaiveTime::from_hms_micro_opt(23, 59, 58, 123456).unwrap());
        let wire = encode(&value);
        assert_eq!(wire["microsecond"], 123456);
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn datetime_iso_string_includes_microseconds_only_when_nonzero() {
        let date = NaiveDate::from_ymd_opt(2020, 1, 2).unwrap();
        let plain = Value::DateTime(NaiveDateTime::new(
            date,
            NaiveTime::from_hms_opt(3, 4, 5).unwrap(),
        ));
        assert_eq!(encode(&plain)["iso_string"], "2020-01-02T03:04:05");

        let micros = Value::DateTime(NaiveDateTime::new(
            date,
            NaiveTime::from_hms_micro_opt(3, 4, 5, 6).unwrap(),
        ));
        assert_eq!(encode(&micros)["iso_string"], "2020-01-02T03:04:05.000006");
        assert_eq!(roundtrip(micros.clone()), micros);
    }

    #[test]
    fn duration_roundtrips_including_negative() {
        let value = Value::Duration(TimeDelta::nanoseconds(-1_500_000_000));
        let wire = encode(&value);
        assert_eq!(wire["seconds"], -1.5);
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn bytes_roundtrip_through_base64() {
        let value = Value::bytes(b"\x00\x01binary".to_vec());
        let wire = encode(&value);
        assert_eq!(wire["__class__"], "bytes");
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn reference_roundtrips() {
        let value = Value::Reference(Reference {
            model_name: "contact".to_string(),
            id: 7,
            rec_name: Some("Jon Doe".to_string()),
        });
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn task_envelope_decodes_to_task_ref() {
        let codec = Codec::default();
        let wire = json!({"__class__": "AsyncResult", "task_id": "t-1", "token": "tok"});
        let decoded = codec.decode(&wire).unwrap();
        match decoded {
            Value::Task(t) => {
                assert_eq!(t.task_id, "t-1");
                assert_eq!(t.token, "tok");
            }
            other => panic!("expected task, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_passes_through_as_map() {
        let codec = Codec::default();
        let wire = json!({"__class__": "frobnicator", "x": 1});
        let decoded = codec.decode(&wire).unwrap();
        let map = decoded.as_map().unwrap();
        assert_eq!(map["__class__"], Value::String("frobnicator".to_string()));
        assert_eq!(map["x"], Value::Int(1));
    }

    #[test]
    fn untagged_object_stays_a_plain_map() {
        let codec = Codec::default();
        let decoded = codec.decode(&json!({"a": [1, 2.5, null]})).unwrap();
        let map = decoded.as_map().unwrap();
        assert_eq!(
            map["a"],
            Value::List(vec![Value::Int(1), Value::Float(2.5), Value::Null])
        );
    }

    #[test]
    fn nested_envelopes_decode_inside_plain_shapes() {
        let codec = Codec::default();
        let wire = json!({
            "total": {"__class__": "Decimal", "decimal": "9.99"},
            "lines": [{"__class__": "date", "year": 2021, "month": 6, "day": 1}],
        });
        let decoded = codec.decode(&wire).unwrap();
        let map = decoded.as_map().unwrap();
        assert_eq!(map["total"], Value::Decimal("9.99".parse().unwrap()));
        assert_eq!(
            map["lines"],
            Value::List(vec![Value::Date(NaiveDate::from_ymd_opt(2021, 6, 1).unwrap())])
        );
    }

    #[test]
    fn registering_a_duplicate_kind_fails() {
        let mut codec = Codec::default();
        let err = codec.register("datetime", decode_datetime).unwrap_err();
        assert!(matches!(err, CodecError::DuplicateKind(kind) if kind == "datetime"));
    }

    #[test]
    fn custom_kind_registers_on_empty_registry() {
        let mut codec = Codec::empty();
        codec.register("Decimal", decode_decimal).unwrap();
        let decoded = codec
            .decode(&json!({"__class__": "Decimal", "decimal": "1.25"}))
            .unwrap();
        assert_eq!(decoded, Value::Decimal("1.25".parse().unwrap()));
        // Other kinds are unknown to this registry and pass through.
        let other = codec
            .decode(&json!({"__class__": "date", "year": 2021, "month": 1, "day": 1}))
            .unwrap();
        assert!(other.as_map().is_some());
    }

    #[test]
    fn malformed_date_reports_kind_and_reason() {
        let codec = Codec::default();
        let err = codec
            .decode(&json!({"__class__": "date", "year": 2021, "month": 13, "day": 1}))
            .unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope { ref kind, .. } if kind == "date"));
    }

    #[test]
    fn malformed_base64_fails() {
        let codec = Codec::default();
        let err = codec
            .decode(&json!({"__class__": "bytes", "base64": "!!not base64!!"}))
            .unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope { ref kind, .. } if kind == "bytes"));
    }

    #[test]
    fn missing_envelope_field_fails() {
        let codec = Codec::default();
        let err = codec
            .decode(&json!({"__class__": "datetime", "year": 2021}))
            .unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope { .. }));
    }

    #[test]
    fn numbers_decode_to_int_or_float() {
        let codec = Codec::default();
        assert_eq!(codec.decode(&json!(12)).unwrap(), Value::Int(12));
        assert_eq!(codec.decode(&json!(-3)).unwrap(), Value::Int(-3));
        assert_eq!(codec.decode(&json!(2.5)).unwrap(), Value::Float(2.5));
    }

    #[test]
    fn decode_str_reports_invalid_json() {
        let codec = Codec::default();
        assert!(matches!(
            codec.decode_str("not json").unwrap_err(),
            CodecError::Json(_)
        ));
    }

    #[test]
    fn encode_to_string_is_parseable_json() {
        let mut map = ValueMap::new();
        map.insert("qty".to_string(), Value::Int(3));
        let text = encode_to_string(&Value::Map(map));
        assert_eq!(text, r#"{"qty":3}"#);
    }
}
