//! Lenient lookups into platform JSON. Platforms drop or null fields
//! freely, so absent values fall back to zero or `None` instead of failing.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Unsigned count at `pointer`; also accepts numeric strings.
pub(crate) fn count(value: &Value, pointer: &str) -> u64 {
    match value.pointer(pointer) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Signed count at `pointer`, for engagement fields.
pub(crate) fn int(value: &Value, pointer: &str) -> i64 {
    i64::try_from(count(value, pointer)).unwrap_or(i64::MAX)
}

pub(crate) fn text(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn flag(value: &Value, pointer: &str) -> bool {
    value.pointer(pointer).and_then(Value::as_bool).unwrap_or(false)
}

/// Unix seconds at `pointer`, as number or numeric string.
pub(crate) fn unix_time(value: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    let secs = match value.pointer(pointer)? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}

/// Raw value at `pointer`, or JSON null.
pub(crate) fn raw(value: &Value, pointer: &str) -> Value {
    value.pointer(pointer).cloned().unwrap_or(Value::Null)
}
