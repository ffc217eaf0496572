//! Record value model.
//!
//! Records flow through the pipeline as JSON maps: fetchers produce the first
//! version, enrichers may add keys, the transformer reads them. Keeping the
//! shape dynamic is what lets enrichers compose without a per-dataset struct.

use serde_json::Map;

/// A single field value inside a record.
pub type Value = serde_json::Value;

/// One normalized record: field key → value.
///
/// Keys starting with `_` are private plumbing between enrichers and never
/// appear in output.
pub type Record = Map<String, Value>;

/// Look up a key, traversing nested maps on dots (`"delivery.city"`).
pub fn get_path<'a>(record: &'a Record, key: &str) -> Option<&'a Value> {
    if let Some(v) = record.get(key) {
        return Some(v);
    }
    let mut parts = key.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// True when the record has no usable value under `key`.
pub fn is_missing(record: &Record, key: &str) -> bool {
    !matches!(get_path(record, key), Some(v) if !v.is_null())
}

/// Insert `value` only when the key is absent or null.
///
/// This is the key-stability rule every enricher must follow: existing
/// non-null values are never overwritten, so chained enrichers compose
/// regardless of execution order. Returns whether the value was stored.
pub fn set_if_absent(record: &mut Record, key: &str, value: Value) -> bool {
    match record.get(key) {
        Some(existing) if !existing.is_null() => false,
        _ => {
            record.insert(key.to_string(), value);
            true
        }
    }
}

/// Coerce a value to `f64`, accepting numbers and numeric strings.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

/// Coerce a value to `i64`, accepting numbers and numeric strings.
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Round to two decimal places. Monetary math in the enrichers and the
/// transformer always goes through this.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Build a JSON number out of an `f64`, falling back to null for NaN/inf.
pub fn num(x: f64) -> Value {
    serde_json::Number::from_f64(x).map_or(Value::Null, Value::Number)
}
