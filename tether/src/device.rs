use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::remote::{
    ApplyOpts, DeviceState, DeviceStateError, DeviceStatus, ReportHandle, SetTargetError,
};

/// A target state accepted by the device and waiting to be applied
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AcceptedTarget {
    pub target: Value,
    #[serde(flatten)]
    pub opts: ApplyOpts,
}

#[derive(Default)]
struct Targets {
    /// Last target that passed validation
    stored: Option<Value>,
    /// Last target the device was asked to apply
    accepted: Option<AcceptedTarget>,
}

/// In-memory view of the device
///
/// The local engine pushes the device status through the local API and reads
/// back the target it needs to apply.
#[derive(Default)]
pub struct LocalDevice {
    status: Mutex<DeviceStatus>,
    targets: Mutex<Targets>,
    report: OnceLock<ReportHandle>,
}

impl LocalDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notify the given reporter on every status change
    pub fn report_to(&self, handle: ReportHandle) {
        if self.report.set(handle).is_err() {
            debug!("device status is already being reported");
        }
    }

    /// Merge a partial status into the device status
    pub fn update_status(&self, update: &DeviceStatus) -> Result<(), DeviceStateError> {
        let changed = {
            let mut status = self
                .status
                .lock()
                .map_err(|_| DeviceStateError::new("status lock poisoned"))?;
            let before = status.clone();
            status.merge(update);
            *status != before
        };

        if changed && let Some(report) = self.report.get() {
            report.notify_state_changed();
        }
        Ok(())
    }

    /// The last target state the device was asked to apply
    pub fn accepted_target(&self) -> Option<AcceptedTarget> {
        self.targets
            .lock()
            .ok()
            .and_then(|targets| targets.accepted.clone())
    }
}

/// Check the target carries a usable config for this device
fn validate_target(target: &Value) -> Result<(), SetTargetError> {
    let local = target
        .get("local")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            SetTargetError::ContractValidation("target state has no local device".to_owned())
        })?;

    if let Some(config) = local.get("config") {
        let config = config.as_object().ok_or_else(|| {
            SetTargetError::ContractValidation("device config must be an object".to_owned())
        })?;
        let invalid: Vec<_> = config
            .iter()
            .filter(|(_, value)| !value.is_string())
            .map(|(key, _)| format!("config value for {key} must be a string"))
            .collect();
        if !invalid.is_empty() {
            return Err(SetTargetError::ContractValidation(invalid.join("\n")));
        }
    }

    Ok(())
}

#[async_trait]
impl DeviceState for LocalDevice {
    async fn status(&self) -> Result<DeviceStatus, DeviceStateError> {
        self.status
            .lock()
            .map(|status| status.clone())
            .map_err(|_| DeviceStateError::new("status lock poisoned"))
    }

    async fn current_config(&self) -> Result<BTreeMap<String, String>, DeviceStateError> {
        let status = self.status().await?;
        let config = status
            .local
            .get("config")
            .and_then(Value::as_object)
            .map(|config| {
                config
                    .iter()
                    .map(|(key, value)| {
                        let value = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (key.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(config)
    }

    fn connected(&self) -> bool {
        // devices that never said otherwise are assumed online
        self.status
            .lock()
            .ok()
            .and_then(|status| status.local.get("is_online").and_then(Value::as_bool))
            .unwrap_or(true)
    }

    async fn set_target(&self, target: Value) -> Result<(), SetTargetError> {
        validate_target(&target)?;
        let mut targets = self
            .targets
            .lock()
            .map_err(|_| SetTargetError::Other("target lock poisoned".into()))?;
        targets.stored = Some(target);
        Ok(())
    }

    fn trigger_apply_target(&self, opts: ApplyOpts) {
        let Ok(mut targets) = self.targets.lock() else {
            return;
        };
        if let Some(target) = targets.stored.clone() {
            info!(force = opts.force, "applying target state");
            targets.accepted = Some(AcceptedTarget { target, opts });
        }
    }
}
