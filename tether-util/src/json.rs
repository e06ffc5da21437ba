use std::time::Duration;

use serde::{Deserializer, Serializer};

pub fn deserialize_duration_from_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let ms: u64 = serde::Deserialize::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
}

pub fn serialize_duration_to_ms<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Read a millisecond count out of a JSON value
///
/// Accepts numbers and numeric strings, as config values coming from the
/// backend are often stringly typed.
pub fn duration_from_ms_value(value: &serde_json::Value) -> Option<Duration> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().map(Duration::from_millis),
        serde_json::Value::String(s) => s.trim().parse::<u64>().ok().map(Duration::from_millis),
        _ => None,
    }
}
