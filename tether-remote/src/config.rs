use std::collections::HashMap;
use std::fmt::{self, Display};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::util::json::{
    deserialize_duration_from_ms, duration_from_ms_value, serialize_duration_to_ms,
};
use crate::util::store::{Store, StoreError};

// IMPORTANT: the key names below are persisted to disk as document names.
// Renaming a key means the device loses that value on upgrade, and for
// `deviceId` or `provisioningOptions` that means losing its identity.

/// Configuration keys consumed by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    ApiEndpoint,
    Unmanaged,
    BootstrapRetryDelay,
    InitialDeviceName,
    InitialConfigReported,
    DeviceId,
    ApiTimeout,
    Uuid,
    LocalMode,
    ProvisioningOptions,
    PinDevice,
    ApiKey,
    Provisioned,
    AppUpdatePollInterval,
    ConnectivityCheckEnabled,
    InstantUpdates,
}

impl ConfigKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::ApiEndpoint => "apiEndpoint",
            ConfigKey::Unmanaged => "unmanaged",
            ConfigKey::BootstrapRetryDelay => "bootstrapRetryDelay",
            ConfigKey::InitialDeviceName => "initialDeviceName",
            ConfigKey::InitialConfigReported => "initialConfigReported",
            ConfigKey::DeviceId => "deviceId",
            ConfigKey::ApiTimeout => "apiTimeout",
            ConfigKey::Uuid => "uuid",
            ConfigKey::LocalMode => "localMode",
            ConfigKey::ProvisioningOptions => "provisioningOptions",
            ConfigKey::PinDevice => "pinDevice",
            ConfigKey::ApiKey => "apiKey",
            ConfigKey::Provisioned => "provisioned",
            ConfigKey::AppUpdatePollInterval => "appUpdatePollInterval",
            ConfigKey::ConnectivityCheckEnabled => "connectivityCheckEnabled",
            ConfigKey::InstantUpdates => "instantUpdates",
        }
    }

    /// Value used when nothing has been stored for the key
    pub fn default_value(&self) -> Option<Value> {
        match self {
            ConfigKey::Unmanaged => Some(json!(false)),
            ConfigKey::BootstrapRetryDelay => Some(json!(30_000)),
            ConfigKey::ApiTimeout => Some(json!(15 * 60 * 1000)),
            ConfigKey::LocalMode => Some(json!(false)),
            ConfigKey::Provisioned => Some(json!(false)),
            ConfigKey::ConnectivityCheckEnabled => Some(json!(true)),
            ConfigKey::InstantUpdates => Some(json!(true)),
            ConfigKey::AppUpdatePollInterval => Some(json!(900_000)),
            _ => None,
        }
    }
}

impl Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read/write config: {0}")]
    Store(#[from] StoreError),

    #[error("invalid value for config key `{key}`: {source}")]
    Decode {
        key: ConfigKey,
        source: serde_json::Error,
    },
}

/// Key/value configuration storage
///
/// Values are plain JSON; typed access goes through [`ConfigValues`].
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read the stored value for the key, without applying defaults
    async fn get_raw(&self, key: ConfigKey) -> Result<Option<Value>, ConfigError>;

    /// Store all the given values
    async fn set(&self, values: Vec<(ConfigKey, Value)>) -> Result<(), ConfigError>;

    /// Remove the value for the key. Removing a missing key succeeds
    async fn remove(&self, key: ConfigKey) -> Result<(), ConfigError>;

    /// Read the value for the key, falling back to the key default
    async fn get(&self, key: ConfigKey) -> Result<Option<Value>, ConfigError> {
        let value = self.get_raw(key).await?.filter(|v| !v.is_null());
        Ok(value.or_else(|| key.default_value()))
    }

    async fn get_many(&self, keys: &[ConfigKey]) -> Result<ConfigValues, ConfigError> {
        let mut values = HashMap::new();
        for key in keys {
            if let Some(value) = self.get(*key).await? {
                values.insert(*key, value);
            }
        }
        Ok(ConfigValues(values))
    }
}

/// A snapshot of config values read in one go
#[derive(Debug, Clone, Default)]
pub struct ConfigValues(HashMap<ConfigKey, Value>);

impl ConfigValues {
    pub fn value(&self, key: ConfigKey) -> Option<&Value> {
        self.0.get(&key)
    }

    pub fn get<T: DeserializeOwned>(&self, key: ConfigKey) -> Result<Option<T>, ConfigError> {
        self.0
            .get(&key)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|source| ConfigError::Decode { key, source })
    }

    /// Read a non-empty string value
    pub fn string(&self, key: ConfigKey) -> Option<String> {
        match self.0.get(&key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    /// Read a boolean, accepting the string forms the backend uses
    pub fn flag(&self, key: ConfigKey) -> bool {
        match self.0.get(&key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.trim(), "true" | "1" | "on"),
            Some(Value::Number(n)) => n.as_u64().is_some_and(|n| n != 0),
            _ => false,
        }
    }

    /// Read a duration stored in milliseconds
    pub fn duration(&self, key: ConfigKey) -> Option<Duration> {
        self.0.get(&key).and_then(duration_from_ms_value)
    }
}

/// Config store keeping one JSON document per key
#[derive(Clone, Debug)]
pub struct FileConfigStore {
    store: Store,
}

impl FileConfigStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            store: Store::new(root),
        }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get_raw(&self, key: ConfigKey) -> Result<Option<Value>, ConfigError> {
        Ok(self.store.read(key.as_str()).await?)
    }

    async fn set(&self, values: Vec<(ConfigKey, Value)>) -> Result<(), ConfigError> {
        for (key, value) in values {
            debug!("storing {key} config");
            self.store.write(key.as_str(), &value).await?;
        }
        Ok(())
    }

    async fn remove(&self, key: ConfigKey) -> Result<(), ConfigError> {
        debug!("removing {key} config");
        self.store.delete(key.as_str()).await?;
        Ok(())
    }
}

/// Request tuning for the backend
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RequestConfig {
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub timeout: Duration,

    /// Minimum time between two state reports
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub report_min_interval: Duration,

    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub poll_max_jitter: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(59_000),
            report_min_interval: Duration::from_millis(10_000),
            poll_max_jitter: Duration::from_millis(60_000),
        }
    }
}
