use serde_json::{Map, Value};

use crate::device::DeviceStatus;

/// Fields used internally by the device state that must never reach the backend
pub const INTERNAL_STATE_KEYS: [&str; 3] = ["update_pending", "update_downloaded", "update_failed"];

/// Compute the reportable changes between the current state and the
/// last state acknowledged by the backend.
///
/// A namespace with no changes is left empty, so a result for which
/// [`DeviceStatus::is_empty`] is true means there is nothing to send.
pub fn diff(current: &DeviceStatus, last_reported: &DeviceStatus) -> DeviceStatus {
    DeviceStatus {
        local: diff_namespace(&current.local, &last_reported.local),
        dependent: diff_namespace(&current.dependent, &last_reported.dependent),
    }
}

fn diff_namespace(current: &Map<String, Value>, last: &Map<String, Value>) -> Map<String, Value> {
    current
        .iter()
        .filter(|(key, _)| !INTERNAL_STATE_KEYS.contains(&key.as_str()))
        .filter(|(key, value)| last.get(key.as_str()) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
