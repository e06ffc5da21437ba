use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{ApiError, QueryOptions};
use crate::config::{ConfigError, ConfigKey, ConfigStore};
use crate::context::ApiContext;
use crate::error::InternalInconsistency;
use crate::register::{ProvisioningOptions, Registrar};
use crate::util::types::ApiKey;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Inconsistency(#[from] InternalInconsistency),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("remote request failed: {0}")]
    Api(#[from] ApiError),

    #[error("no provisioning options configured")]
    MissingOptions,

    #[error("device is not registered and no provisioning key is configured")]
    MissingProvisioningKey,

    #[error("no successful release found for app {app} and commit {commit}")]
    ReleaseNotFound { app: u64, commit: String },
}

impl ProvisioningError {
    /// Errors that retrying will not fix
    ///
    /// Missing options or keys are retried, they may be configured later.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProvisioningError::Inconsistency(_) | ProvisioningError::ReleaseNotFound { .. }
        )
    }
}

/// Request to pin the device to a specific release of an app
///
/// Both fields must be present for the directive to be used.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PinDirective {
    #[serde(default)]
    pub app: Option<u64>,

    #[serde(default)]
    pub commit: Option<String>,
}

/// The provisioning related configuration
#[derive(Clone, Debug)]
pub struct ProvisioningConfig {
    pub api_key: Option<ApiKey>,
    pub pin_target: Option<Value>,
    pub provisioned: bool,
    pub retry_delay: Duration,
}

impl ProvisioningConfig {
    pub async fn read(config: &dyn ConfigStore) -> Result<Self, ConfigError> {
        let conf = config
            .get_many(&[
                ConfigKey::ApiKey,
                ConfigKey::BootstrapRetryDelay,
                ConfigKey::PinDevice,
                ConfigKey::Provisioned,
            ])
            .await?;

        Ok(Self {
            api_key: conf.string(ConfigKey::ApiKey).map(ApiKey::from),
            pin_target: conf.value(ConfigKey::PinDevice).cloned(),
            provisioned: conf.flag(ConfigKey::Provisioned),
            retry_delay: conf
                .duration(ConfigKey::BootstrapRetryDelay)
                .unwrap_or(DEFAULT_RETRY_DELAY),
        })
    }

    /// Whether registration or pinning still has to happen
    pub fn needs_provisioning(&self) -> bool {
        !self.provisioned || self.api_key.is_some() || self.pin_target.is_some()
    }
}

/// Wait until the device has been provisioned
///
/// Never returns if provisioning ended without success.
pub async fn wait_provisioned(mut provisioned: watch::Receiver<bool>) {
    let res = provisioned.wait_for(|provisioned| *provisioned).await.map(|_| ());
    if res.is_err() {
        debug!("device was never provisioned");
        std::future::pending::<()>().await;
    }
}

/// Makes sure the device has an identity on the backend
pub struct Provisioner {
    context: Arc<ApiContext>,
    config: Arc<dyn ConfigStore>,
    registrar: Arc<dyn Registrar>,
    provisioned: watch::Sender<bool>,
}

impl Provisioner {
    pub fn new(
        context: Arc<ApiContext>,
        config: Arc<dyn ConfigStore>,
        registrar: Arc<dyn Registrar>,
    ) -> Self {
        Self {
            context,
            config,
            registrar,
            provisioned: watch::Sender::new(false),
        }
    }

    /// Receive the value `true` once the device has been provisioned
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.provisioned.subscribe()
    }

    /// Provision the device if needed, retrying until it succeeds
    ///
    /// Only returns an error if provisioning cannot succeed at all.
    #[instrument(name = "provision", skip_all, err)]
    pub async fn provision(&self) -> Result<(), ProvisioningError> {
        let conf = ProvisioningConfig::read(self.config.as_ref()).await?;
        if !conf.needs_provisioning() {
            debug!("device already provisioned");
            self.mark_provisioned();
            return Ok(());
        }

        loop {
            info!("provisioning device");
            match self.try_provision().await {
                Ok(()) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        "provisioning failed, retrying in {:?}: {e}",
                        conf.retry_delay
                    );
                    tokio::time::sleep(conf.retry_delay).await;
                }
            }
        }

        info!("device provisioned");
        self.mark_provisioned();
        Ok(())
    }

    fn mark_provisioned(&self) {
        self.provisioned.send_if_modified(|provisioned| {
            if *provisioned {
                return false;
            }
            *provisioned = true;
            true
        });
    }

    async fn try_provision(&self) -> Result<(), ProvisioningError> {
        let conf = ProvisioningConfig::read(self.config.as_ref()).await?;

        if !conf.provisioned || conf.api_key.is_some() {
            self.register(conf.api_key.as_ref()).await?;
        }

        if let Some(pin) = conf.pin_target {
            match serde_json::from_value::<PinDirective>(pin.clone()) {
                Ok(PinDirective {
                    app: Some(app),
                    commit: Some(commit),
                }) => {
                    info!("pinning device to preloaded release");
                    self.pin(app, &commit).await.inspect_err(|e| {
                        error!("could not pin device to release: {e}");
                    })?;
                }
                _ => error!("malformed pin directive: {pin}"),
            }
        }

        Ok(())
    }

    /// Register the device, or find it if it already exists
    async fn register(&self, api_key: Option<&ApiKey>) -> Result<(), ProvisioningError> {
        let options: ProvisioningOptions = self
            .config
            .get_many(&[ConfigKey::ProvisioningOptions])
            .await?
            .get(ConfigKey::ProvisioningOptions)?
            .ok_or(ProvisioningError::MissingOptions)?;

        let device_id = match self.registrar.lookup(&options).await? {
            Some(id) => {
                debug!("device already exists on the remote");
                id
            }
            None => {
                let key = api_key.ok_or(ProvisioningError::MissingProvisioningKey)?;
                self.registrar.register(key, &options).await?
            }
        };

        self.config
            .set(vec![
                (ConfigKey::DeviceId, json!(device_id)),
                (ConfigKey::Uuid, json!(options.uuid)),
                (ConfigKey::Provisioned, json!(true)),
            ])
            .await?;
        self.config.remove(ConfigKey::ApiKey).await?;
        info!(device_id, "device registered");

        Ok(())
    }

    /// Point the device to a successful release of the app with the given commit
    async fn pin(&self, app: u64, commit: &str) -> Result<(), ProvisioningError> {
        let client = self.context.client("pin device")?;
        let device_id: u64 = self
            .config
            .get_many(&[ConfigKey::DeviceId])
            .await?
            .get(ConfigKey::DeviceId)?
            .ok_or_else(|| InternalInconsistency::new("device id not defined when pinning"))?;

        let releases = client
            .get(
                "release",
                None,
                QueryOptions::default()
                    .filter("belongs_to__application", app)
                    .filter("commit", commit)
                    .filter("status", "success")
                    .select(&["id"]),
            )
            .await?;

        let release_id = releases
            .first()
            .and_then(|release| release.get("id"))
            .and_then(Value::as_u64)
            .ok_or_else(|| ProvisioningError::ReleaseNotFound {
                app,
                commit: commit.to_owned(),
            })?;

        client
            .patch(
                "device",
                device_id,
                json!({ "should_be_running__release": release_id }),
            )
            .await?;

        // the pin only ever happens once
        self.config.remove(ConfigKey::PinDevice).await?;
        Ok(())
    }
}
