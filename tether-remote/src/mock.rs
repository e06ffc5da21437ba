//! Test doubles for the collaborator traits
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::client::{ApiError, BackendClient, QueryOptions};
use crate::config::{ConfigError, ConfigKey, ConfigStore};
use crate::device::{ApplyOpts, DeviceState, DeviceStateError, DeviceStatus, SetTargetError};
use crate::register::{ProvisioningOptions, Registrar};
use crate::target::TargetSource;
use crate::util::types::{ApiKey, Uuid};

#[derive(Default)]
pub struct MockConfigStore {
    values: Mutex<HashMap<ConfigKey, Value>>,
}

impl MockConfigStore {
    pub fn with(values: Vec<(ConfigKey, Value)>) -> Self {
        Self {
            values: Mutex::new(values.into_iter().collect()),
        }
    }

    pub fn value(&self, key: ConfigKey) -> Option<Value> {
        self.values.lock().unwrap().get(&key).cloned()
    }
}

#[async_trait]
impl ConfigStore for MockConfigStore {
    async fn get_raw(&self, key: ConfigKey) -> Result<Option<Value>, ConfigError> {
        Ok(self.value(key))
    }

    async fn set(&self, values: Vec<(ConfigKey, Value)>) -> Result<(), ConfigError> {
        self.values.lock().unwrap().extend(values);
        Ok(())
    }

    async fn remove(&self, key: ConfigKey) -> Result<(), ConfigError> {
        self.values.lock().unwrap().remove(&key);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Get {
        resource: String,
        options: QueryOptions,
    },
    Post {
        resource: String,
        body: Value,
    },
    Patch {
        resource: String,
        id: u64,
        body: Value,
    },
    PatchState {
        uuid: Uuid,
        body: DeviceStatus,
    },
}

/// Backend client recording every call
///
/// Queued status codes make the next matching calls fail with that status.
#[derive(Default)]
pub struct MockClient {
    calls: Mutex<Vec<Call>>,
    get_results: Mutex<HashMap<String, Vec<Value>>>,
    post_failures: Mutex<VecDeque<u16>>,
    state_failures: Mutex<VecDeque<u16>>,
    state_gate: Option<Arc<Semaphore>>,
}

impl MockClient {
    pub fn with_get_result(self, resource: &str, result: Vec<Value>) -> Self {
        self.get_results
            .lock()
            .unwrap()
            .insert(resource.to_owned(), result);
        self
    }

    pub fn with_post_failures(self, codes: &[u16]) -> Self {
        self.post_failures.lock().unwrap().extend(codes);
        self
    }

    pub fn with_state_failures(self, codes: &[u16]) -> Self {
        self.state_failures.lock().unwrap().extend(codes);
        self
    }

    /// Make every state patch wait for a permit on the given semaphore
    pub fn with_state_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.state_gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn state_patches(&self) -> Vec<DeviceStatus> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::PatchState { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

fn status_error(code: u16) -> ApiError {
    ApiError::Status {
        code,
        message: "mock failure".to_owned(),
    }
}

#[async_trait]
impl BackendClient for MockClient {
    async fn get(
        &self,
        resource: &str,
        _id: Option<u64>,
        options: QueryOptions,
    ) -> Result<Vec<Value>, ApiError> {
        self.record(Call::Get {
            resource: resource.to_owned(),
            options,
        });
        Ok(self
            .get_results
            .lock()
            .unwrap()
            .get(resource)
            .cloned()
            .unwrap_or_default())
    }

    async fn post(&self, resource: &str, body: Value) -> Result<Value, ApiError> {
        if let Some(code) = self.post_failures.lock().unwrap().pop_front() {
            return Err(status_error(code));
        }
        self.record(Call::Post {
            resource: resource.to_owned(),
            body: body.clone(),
        });
        Ok(body)
    }

    async fn patch(&self, resource: &str, id: u64, body: Value) -> Result<(), ApiError> {
        self.record(Call::Patch {
            resource: resource.to_owned(),
            id,
            body,
        });
        Ok(())
    }

    async fn patch_state(&self, uuid: &Uuid, body: &DeviceStatus) -> Result<(), ApiError> {
        if let Some(gate) = &self.state_gate {
            gate.acquire().await.unwrap().forget();
        }
        if let Some(code) = self.state_failures.lock().unwrap().pop_front() {
            return Err(status_error(code));
        }
        self.record(Call::PatchState {
            uuid: uuid.clone(),
            body: body.clone(),
        });
        Ok(())
    }
}

/// Called after every status snapshot with the number of the call
pub type StatusHook = Box<dyn Fn(&MockDevice, u32) + Send + Sync>;

#[derive(Default)]
pub struct MockDevice {
    pub status: Mutex<DeviceStatus>,
    pub status_calls: AtomicU32,
    pub on_status: Mutex<Option<StatusHook>>,
    pub config: Mutex<BTreeMap<String, String>>,
    pub connected: AtomicBool,
    pub targets: Mutex<Vec<Value>>,
    pub applied: Mutex<Vec<ApplyOpts>>,
    pub reject_with: Mutex<Option<fn(String) -> SetTargetError>>,
}

impl MockDevice {
    pub fn set_status(&self, value: Value) {
        *self.status.lock().unwrap() = serde_json::from_value(value).unwrap();
    }
}

#[async_trait]
impl DeviceState for MockDevice {
    async fn status(&self) -> Result<DeviceStatus, DeviceStateError> {
        let status = self.status.lock().unwrap().clone();
        let call = self.status_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = self.on_status.lock().unwrap().as_ref() {
            hook(self, call);
        }
        Ok(status)
    }

    async fn current_config(&self) -> Result<BTreeMap<String, String>, DeviceStateError> {
        Ok(self.config.lock().unwrap().clone())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn set_target(&self, target: Value) -> Result<(), SetTargetError> {
        if let Some(reject) = *self.reject_with.lock().unwrap() {
            return Err(reject("target rejected\nsecond line".to_owned()));
        }
        self.targets.lock().unwrap().push(target);
        Ok(())
    }

    fn trigger_apply_target(&self, opts: ApplyOpts) {
        self.applied.lock().unwrap().push(opts);
    }
}

#[derive(Default)]
pub struct MockTarget {
    pub target: Mutex<Value>,
    pub last_fetch: Mutex<Option<Instant>>,
}

impl MockTarget {
    pub fn new(target: Value) -> Self {
        Self {
            target: Mutex::new(target),
            last_fetch: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TargetSource for MockTarget {
    async fn get(&self) -> Result<Value, ApiError> {
        *self.last_fetch.lock().unwrap() = Some(Instant::now());
        Ok(self.target.lock().unwrap().clone())
    }

    fn last_fetch(&self) -> Option<Instant> {
        *self.last_fetch.lock().unwrap()
    }
}

/// Registrar failing a configured number of times before succeeding
#[derive(Default)]
pub struct MockRegistrar {
    pub failures: AtomicU32,
    pub registrations: AtomicU32,
    pub existing_device: Option<u64>,
    pub device_id: u64,
}

#[async_trait]
impl Registrar for MockRegistrar {
    async fn lookup(&self, _options: &ProvisioningOptions) -> Result<Option<u64>, ApiError> {
        Ok(self.existing_device)
    }

    async fn register(
        &self,
        _provisioning_key: &ApiKey,
        _options: &ProvisioningOptions,
    ) -> Result<u64, ApiError> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(status_error(500));
        }
        Ok(self.device_id)
    }
}
