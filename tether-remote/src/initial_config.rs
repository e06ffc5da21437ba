use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::client::ApiError;
use crate::config::{ConfigError, ConfigKey, ConfigStore};
use crate::context::ApiContext;
use crate::device::{DeviceState, DeviceStateError};
use crate::error::InternalInconsistency;
use crate::target::TargetSource;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Prefix for config variables created on the backend
const CONFIG_VAR_PREFIX: &str = "RESIN_";

/// Vendor prefixes accepted on target config keys. Later prefixes win
const TARGET_PREFIXES: [&str; 2] = ["RESIN_", "BALENA_"];

/// Device configuration values that are never worth reporting
const DEFAULT_CONFIG: [(&str, &str); 16] = [
    ("HOST_DISCOVERABILITY", "true"),
    ("HOST_FIREWALL_MODE", "off"),
    ("SUPERVISOR_CONNECTIVITY_CHECK", "true"),
    ("SUPERVISOR_DELTA", "false"),
    ("SUPERVISOR_DELTA_APPLY_TIMEOUT", "0"),
    ("SUPERVISOR_DELTA_REQUEST_TIMEOUT", "59000"),
    ("SUPERVISOR_DELTA_RETRY_COUNT", "30"),
    ("SUPERVISOR_DELTA_RETRY_INTERVAL", "10000"),
    ("SUPERVISOR_DELTA_VERSION", "2"),
    ("SUPERVISOR_INSTANT_UPDATE_TRIGGER", "true"),
    ("SUPERVISOR_LOCAL_MODE", "false"),
    ("SUPERVISOR_LOG_CONTROL", "true"),
    ("SUPERVISOR_OVERRIDE_LOCK", "false"),
    ("SUPERVISOR_PERSISTENT_LOGGING", "false"),
    ("SUPERVISOR_POLL_INTERVAL", "900000"),
    ("SUPERVISOR_VPN_CONTROL", "true"),
];

/// Values reported regardless of the current device config
const FORCED_CONFIG: [(&str, &str); 2] = [
    // joining a fleet always leaves local mode
    ("SUPERVISOR_LOCAL_MODE", "false"),
    // the tunnel may just be failing at the moment
    ("SUPERVISOR_VPN_CONTROL", "true"),
];

#[derive(Debug, Error)]
pub enum InitialConfigError {
    #[error(transparent)]
    Inconsistency(#[from] InternalInconsistency),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceStateError),

    #[error("remote request failed: {0}")]
    Api(#[from] ApiError),

    #[error("target state has no local config")]
    MalformedTarget,
}

impl InitialConfigError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, InitialConfigError::Inconsistency(_))
    }
}

fn is_config_key(name: &str) -> bool {
    name.starts_with("SUPERVISOR_") || name.starts_with("HOST_")
}

fn lookup(table: &[(&'static str, &'static str)], key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Strip vendor prefixes from target config keys
///
/// Keys without a known prefix are not device configuration and are
/// dropped. If both prefixed forms of a key exist the `BALENA_` one wins.
pub fn normalize_config_keys(config: &Map<String, Value>) -> BTreeMap<String, Value> {
    let mut normalized = BTreeMap::new();
    for prefix in TARGET_PREFIXES {
        for (key, value) in config {
            if let Some(name) = key.strip_prefix(prefix)
                && is_config_key(name)
                && !value.is_null()
            {
                normalized.insert(name.to_owned(), value.clone());
            }
        }
    }
    normalized
}

/// Config values of the device missing from the target
///
/// Returns the key/value pairs that are not set on the target and do not
/// match the default value for the key.
pub fn config_vars_to_report(
    current: &BTreeMap<String, String>,
    target: &BTreeMap<String, Value>,
) -> Vec<(String, String)> {
    current
        .iter()
        .filter_map(|(key, value)| {
            let value = lookup(&FORCED_CONFIG, key).unwrap_or(value.as_str());
            if target.contains_key(key) || lookup(&DEFAULT_CONFIG, key) == Some(value) {
                return None;
            }
            Some((key.clone(), value.to_owned()))
        })
        .collect()
}

/// Reports the device configuration to a newly joined backend
///
/// Config already set on the backend always wins, only values missing from
/// the target state are created.
pub struct InitialConfigReporter {
    context: Arc<ApiContext>,
    config: Arc<dyn ConfigStore>,
    device: Arc<dyn DeviceState>,
    target: Arc<dyn TargetSource>,
}

impl InitialConfigReporter {
    pub fn new(
        context: Arc<ApiContext>,
        config: Arc<dyn ConfigStore>,
        device: Arc<dyn DeviceState>,
        target: Arc<dyn TargetSource>,
    ) -> Self {
        Self {
            context,
            config,
            device,
            target,
        }
    }

    /// Report the initial config if it has not been reported to this backend
    ///
    /// Retries until the report succeeds.
    #[instrument(name = "initial_config", skip_all, err)]
    pub async fn report_if_needed(&self) -> Result<(), InitialConfigError> {
        let conf = self
            .config
            .get_many(&[
                ConfigKey::ApiEndpoint,
                ConfigKey::InitialConfigReported,
                ConfigKey::DeviceId,
                ConfigKey::BootstrapRetryDelay,
                ConfigKey::InitialDeviceName,
            ])
            .await?;

        let api_endpoint = conf.string(ConfigKey::ApiEndpoint).unwrap_or_default();
        let reported = conf
            .string(ConfigKey::InitialConfigReported)
            .unwrap_or_default();
        if api_endpoint == reported {
            debug!("initial config already reported");
            return Ok(());
        }

        let device_id: u64 = conf.get(ConfigKey::DeviceId)?.ok_or_else(|| {
            InternalInconsistency::new("attempt to report initial configuration without a device ID")
        })?;
        let retry_delay = conf
            .duration(ConfigKey::BootstrapRetryDelay)
            .unwrap_or(DEFAULT_RETRY_DELAY);
        let initial_name = conf.string(ConfigKey::InitialDeviceName);

        info!("reporting initial configuration");
        loop {
            match self
                .try_report(&api_endpoint, device_id, initial_name.as_deref())
                .await
            {
                Ok(()) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("error reporting initial configuration, retrying in {retry_delay:?}: {e}");
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }

        Ok(())
    }

    async fn try_report(
        &self,
        api_endpoint: &str,
        device_id: u64,
        initial_name: Option<&str>,
    ) -> Result<(), InitialConfigError> {
        let client = self.context.client("report initial configuration")?;

        // read the target fresh to avoid overwriting anything already set
        let target = self.target.get().await?;
        let target_config = target
            .pointer("/local/config")
            .and_then(Value::as_object)
            .ok_or(InitialConfigError::MalformedTarget)?;
        let target_config = normalize_config_keys(target_config);

        let current = self.device.current_config().await?;
        for (key, value) in config_vars_to_report(&current, &target_config) {
            debug!("reporting config {key}");
            client
                .post(
                    "device_config_variable",
                    json!({
                        "device": device_id,
                        "name": format!("{CONFIG_VAR_PREFIX}{key}"),
                        "value": value,
                    }),
                )
                .await?;
        }

        if let Some(name) = initial_name {
            client
                .patch("device", device_id, json!({ "device_name": name }))
                .await?;
        }

        self.config
            .set(vec![(ConfigKey::InitialConfigReported, json!(api_endpoint))])
            .await?;
        Ok(())
    }
}
