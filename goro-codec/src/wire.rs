//! Acyclic wire form and the encode/decode pair

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::value::{ErrorValue, Value};

/// The encoded form every payload takes on the channel, regardless of
/// transport. Bytes travel base64-encoded, instants as epoch milliseconds,
/// and the special numerics as their own variants so a JSON hop cannot
/// corrupt them. `Cycle` marks a severed back-reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Num(f64),
    Nan,
    PosInf,
    NegInf,
    Str(String),
    Bytes(String),
    Time(i64),
    Regex { pattern: String, flags: String },
    List(Vec<WireValue>),
    Record(Vec<(String, WireValue)>),
    Map(Vec<(WireValue, WireValue)>),
    Set(Vec<WireValue>),
    Error(ErrorValue),
    Cycle,
}

/// Encode a value into its wire form, severing cycles.
///
/// A `Shared` node already on the current descent path encodes as the
/// `Cycle` sentinel; sharing that is not cyclic is inlined.
pub fn encode(value: &Value) -> WireValue {
    let mut path = Vec::new();
    encode_inner(value, &mut path)
}

fn encode_inner(value: &Value, path: &mut Vec<usize>) -> WireValue {
    match value {
        Value::Null => WireValue::Null,
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Int(n) => WireValue::Int(*n),
        Value::Float(f) => {
            if f.is_nan() {
                WireValue::Nan
            } else if *f == f64::INFINITY {
                WireValue::PosInf
            } else if *f == f64::NEG_INFINITY {
                WireValue::NegInf
            } else {
                WireValue::Num(*f)
            }
        }
        Value::String(s) => WireValue::Str(s.clone()),
        Value::Bytes(b) => WireValue::Bytes(BASE64.encode(b)),
        Value::Time(t) => WireValue::Time(t.timestamp_millis()),
        Value::Regex { pattern, flags } => WireValue::Regex {
            pattern: pattern.clone(),
            flags: flags.clone(),
        },
        Value::List(items) => {
            WireValue::List(items.iter().map(|v| encode_inner(v, path)).collect())
        }
        Value::Record(entries) => WireValue::Record(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), encode_inner(v, path)))
                .collect(),
        ),
        Value::Map(entries) => WireValue::Map(
            entries
                .iter()
                .map(|(k, v)| (encode_inner(k, path), encode_inner(v, path)))
                .collect(),
        ),
        Value::Set(items) => {
            WireValue::Set(items.iter().map(|v| encode_inner(v, path)).collect())
        }
        Value::Error(e) => WireValue::Error(e.clone()),
        Value::Shared(cell) => {
            let id = cell.id();
            if path.contains(&id) {
                return WireValue::Cycle;
            }
            path.push(id);
            let inner = cell.get();
            let wire = encode_inner(&inner, path);
            path.pop();
            wire
        }
    }
}

/// Decode a wire value back into the value model.
///
/// The result is always a finite tree: a severed back-reference drops out of
/// records and decodes to `Null` anywhere else, so list indices hold.
pub fn decode(wire: WireValue) -> Value {
    match wire {
        WireValue::Null | WireValue::Cycle => Value::Null,
        WireValue::Bool(b) => Value::Bool(b),
        WireValue::Int(n) => Value::Int(n),
        WireValue::Num(f) => Value::Float(f),
        WireValue::Nan => Value::Float(f64::NAN),
        WireValue::PosInf => Value::Float(f64::INFINITY),
        WireValue::NegInf => Value::Float(f64::NEG_INFINITY),
        WireValue::Str(s) => Value::String(s),
        WireValue::Bytes(b64) => Value::Bytes(BASE64.decode(b64).unwrap_or_default()),
        WireValue::Time(ms) => DateTime::from_timestamp_millis(ms)
            .map(Value::Time)
            .unwrap_or(Value::Null),
        WireValue::Regex { pattern, flags } => Value::Regex { pattern, flags },
        WireValue::List(items) => Value::List(items.into_iter().map(decode).collect()),
        WireValue::Record(entries) => Value::Record(
            entries
                .into_iter()
                .filter(|(_, v)| !matches!(v, WireValue::Cycle))
                .map(|(k, v)| (k, decode(v)))
                .collect(),
        ),
        WireValue::Map(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (decode(k), decode(v)))
                .collect(),
        ),
        WireValue::Set(items) => Value::Set(items.into_iter().map(decode).collect()),
        WireValue::Error(e) => Value::Error(e),
    }
}

/// Encode an argument list
pub fn encode_args(args: &[Value]) -> Vec<WireValue> {
    args.iter().map(encode).collect()
}

/// Decode an argument list
pub fn decode_args(args: Vec<WireValue>) -> Vec<Value> {
    args.into_iter().map(decode).collect()
}
