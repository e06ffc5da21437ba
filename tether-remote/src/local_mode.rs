use crate::device::DeviceStatus;

/// Fields that only make sense to a device managed by a fleet
const FLEET_ONLY_FIELDS: [&str; 3] = ["apps", "is_on__commit", "logs_channel"];

/// Strip the parts of a state report that should not leave a device
/// running in local mode.
///
/// Application information is removed from `local` and the `dependent`
/// namespace is dropped entirely.
pub fn strip_for_local_mode(status: &DeviceStatus) -> DeviceStatus {
    let local = status
        .local
        .iter()
        .filter(|(key, _)| !FLEET_ONLY_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    DeviceStatus {
        local,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn it_removes_fleet_fields_and_dependent_devices() {
        let status: DeviceStatus = serde_json::from_value(json!({
            "local": {"apps": {"1": {}}, "other": "x"},
            "dependent": {"2": {}}
        }))
        .unwrap();

        let stripped = strip_for_local_mode(&status);
        assert_eq!(
            serde_json::to_value(&stripped).unwrap(),
            json!({"local": {"other": "x"}})
        );
    }

    #[test]
    fn it_can_leave_nothing_to_send() {
        let status: DeviceStatus = serde_json::from_value(json!({
            "local": {"is_on__commit": "abc", "logs_channel": "xyz"},
        }))
        .unwrap();

        assert!(strip_for_local_mode(&status).is_empty());
    }
}
