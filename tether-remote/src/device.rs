use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Observable state of the device
///
/// `local` covers this device and `dependent` the child devices it manages.
/// Empty namespaces are left out of the serialized form, which is also the
/// body format expected by the backend state endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub local: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub dependent: Map<String, Value>,
}

impl DeviceStatus {
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.dependent.is_empty()
    }

    /// Assign every top level field of `other` into this status
    ///
    /// Fields not present in `other` are kept.
    pub fn merge(&mut self, other: &DeviceStatus) {
        for (key, value) in other.local.iter() {
            self.local.insert(key.clone(), value.clone());
        }
        for (key, value) in other.dependent.iter() {
            self.dependent.insert(key.clone(), value.clone());
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to read device state: {0}")]
pub struct DeviceStateError(String);

impl DeviceStateError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Reasons for the device to refuse a target state
#[derive(Debug, Error)]
pub enum SetTargetError {
    /// The target does not match the expected schema
    #[error("{0}")]
    ContractValidation(String),

    /// The target requirements cannot be met by this device
    #[error("{0}")]
    ContractViolation(String),

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Options passed along when applying a new target
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOpts {
    #[serde(default)]
    pub force: bool,

    #[serde(default)]
    pub is_from_api: bool,
}

/// The device state collaborator
///
/// Owns the live view of the device and applies target states. The agent
/// only reads from it and hands it new targets.
#[async_trait]
pub trait DeviceState: Send + Sync {
    /// Full observable snapshot of the device
    async fn status(&self) -> Result<DeviceStatus, DeviceStateError>;

    /// Current device configuration, keyed without any vendor prefix
    async fn current_config(&self) -> Result<BTreeMap<String, String>, DeviceStateError>;

    /// Whether the device reports itself as connected to the network
    fn connected(&self) -> bool;

    /// Validate and store a new target state
    async fn set_target(&self, target: Value) -> Result<(), SetTargetError>;

    /// Request the stored target state to be applied
    fn trigger_apply_target(&self, opts: ApplyOpts);
}
