use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::instrument;

use crate::client::{ApiError, BackendClient, QueryOptions};
use crate::config::{ConfigError, ConfigKey, ConfigStore, ConfigValues, RequestConfig};
use crate::context::ApiContext;
use crate::error::InternalInconsistency;
use crate::util::types::Uuid;

#[derive(Debug, Error)]
pub enum DeviceApiError {
    #[error(transparent)]
    Inconsistency(#[from] InternalInconsistency),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("remote request failed: {0}")]
    Api(#[from] ApiError),

    #[error("cannot {0} in unmanaged mode")]
    Unmanaged(&'static str),

    #[error("device must be provisioned to {0}")]
    NotProvisioned(&'static str),

    #[error("invalid device tag {tag}: {source}")]
    InvalidTag {
        tag: Value,
        source: serde_json::Error,
    },
}

/// A tag set on the device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTag {
    pub id: u64,
    pub name: String,
    pub value: String,
}

#[derive(Deserialize)]
struct RemoteTag {
    id: u64,
    tag_key: String,
    value: String,
}

/// Operations on the device resource of the backend
pub struct DeviceApi {
    context: Arc<ApiContext>,
    config: Arc<dyn ConfigStore>,
}

impl DeviceApi {
    pub fn new(context: Arc<ApiContext>, config: Arc<dyn ConfigStore>) -> Self {
        Self { context, config }
    }

    /// Read the config shared by the device operations and check the device
    /// can talk to the backend
    async fn managed_client(
        &self,
        action: &'static str,
        keys: &[ConfigKey],
    ) -> Result<(Arc<dyn BackendClient>, ConfigValues, Duration), DeviceApiError> {
        let conf = self.config.get_many(keys).await?;
        if conf.flag(ConfigKey::Unmanaged) {
            return Err(DeviceApiError::Unmanaged(action));
        }
        if !conf.flag(ConfigKey::Provisioned) {
            return Err(DeviceApiError::NotProvisioned(action));
        }
        let client = self.context.client(action)?;
        let timeout = conf
            .duration(ConfigKey::ApiTimeout)
            .unwrap_or_else(|| RequestConfig::default().timeout);
        Ok((client, conf, timeout))
    }

    /// Update fields of a device
    #[instrument(skip(self, fields), err)]
    pub async fn patch_device(&self, id: u64, fields: Value) -> Result<(), DeviceApiError> {
        let (client, _, timeout) = self
            .managed_client(
                "update a device",
                &[
                    ConfigKey::Unmanaged,
                    ConfigKey::Provisioned,
                    ConfigKey::ApiTimeout,
                ],
            )
            .await?;

        tokio::time::timeout(timeout, client.patch("device", id, fields))
            .await
            .map_err(|_| ApiError::Timeout(timeout))??;
        Ok(())
    }

    /// Register a device managed by this one
    ///
    /// Fills in the managing device, a new uuid and the registration time
    /// unless the given device already sets them.
    #[instrument(skip_all, err)]
    pub async fn provision_dependent_device(
        &self,
        mut device: Map<String, Value>,
    ) -> Result<Value, DeviceApiError> {
        let (client, conf, timeout) = self
            .managed_client(
                "provision a dependent device",
                &[
                    ConfigKey::Unmanaged,
                    ConfigKey::Provisioned,
                    ConfigKey::ApiTimeout,
                    ConfigKey::DeviceId,
                ],
            )
            .await?;

        let device_id: Option<u64> = conf.get(ConfigKey::DeviceId)?;
        let registered_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        device
            .entry("is_managed_by__device")
            .or_insert(json!(device_id));
        device
            .entry("uuid")
            .or_insert_with(|| json!(Uuid::default()));
        device
            .entry("registered_at")
            .or_insert(json!(registered_at));

        let created = tokio::time::timeout(timeout, client.post("device", Value::Object(device)))
            .await
            .map_err(|_| ApiError::Timeout(timeout))??;
        Ok(created)
    }

    /// Fetch the tags of this device
    #[instrument(skip_all, err)]
    pub async fn fetch_device_tags(&self) -> Result<Vec<DeviceTag>, DeviceApiError> {
        let client = self.context.client("fetch device tags")?;
        let device_id: u64 = self
            .config
            .get_many(&[ConfigKey::DeviceId])
            .await?
            .get(ConfigKey::DeviceId)?
            .ok_or(DeviceApiError::NotProvisioned("fetch device tags"))?;

        let tags = client
            .get(
                "device_tag",
                None,
                QueryOptions::default()
                    .filter("device", device_id)
                    .select(&["id", "tag_key", "value"]),
            )
            .await?;

        tags.into_iter()
            .map(|tag| {
                serde_json::from_value::<RemoteTag>(tag.clone())
                    .map(|remote| DeviceTag {
                        id: remote.id,
                        name: remote.tag_key,
                        value: remote.value,
                    })
                    .map_err(|source| DeviceApiError::InvalidTag { tag, source })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::mock::{Call, MockClient, MockConfigStore};

    fn device_api(client: Arc<MockClient>, config: Vec<(ConfigKey, Value)>) -> DeviceApi {
        let context = Arc::new(ApiContext::new());
        context.init_client(client).unwrap();
        DeviceApi::new(context, Arc::new(MockConfigStore::with(config)))
    }

    fn provisioned() -> Vec<(ConfigKey, Value)> {
        vec![
            (ConfigKey::Provisioned, json!(true)),
            (ConfigKey::DeviceId, json!(42)),
        ]
    }

    #[tokio::test]
    async fn it_patches_the_device() {
        let client = Arc::new(MockClient::default());
        let api = device_api(client.clone(), provisioned());

        api.patch_device(42, json!({"note": "hello"})).await.unwrap();

        assert_eq!(
            client.calls(),
            vec![Call::Patch {
                resource: "device".to_owned(),
                id: 42,
                body: json!({"note": "hello"}),
            }]
        );
    }

    #[tokio::test]
    async fn it_refuses_to_patch_when_unmanaged_or_unprovisioned() {
        let client = Arc::new(MockClient::default());

        let mut config = provisioned();
        config.push((ConfigKey::Unmanaged, json!(true)));
        let api = device_api(client.clone(), config);
        assert!(matches!(
            api.patch_device(42, json!({})).await,
            Err(DeviceApiError::Unmanaged(_))
        ));

        let api = device_api(client.clone(), vec![]);
        assert!(matches!(
            api.patch_device(42, json!({})).await,
            Err(DeviceApiError::NotProvisioned(_))
        ));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn it_fills_in_dependent_device_defaults() {
        let client = Arc::new(MockClient::default());
        let api = device_api(client.clone(), provisioned());

        let device = json!({"device_name": "sensor", "uuid": "fixed"});
        let created = api
            .provision_dependent_device(device.as_object().unwrap().clone())
            .await
            .unwrap();

        assert_eq!(created.get("is_managed_by__device"), Some(&json!(42)));
        assert_eq!(created.get("uuid"), Some(&json!("fixed")));
        assert_eq!(created.get("device_name"), Some(&json!("sensor")));
        assert!(created.get("registered_at").is_some_and(Value::is_u64));
    }

    #[tokio::test]
    async fn it_generates_a_uuid_for_dependent_devices() {
        let client = Arc::new(MockClient::default());
        let api = device_api(client, provisioned());

        let created = api.provision_dependent_device(Map::new()).await.unwrap();

        let uuid = created.get("uuid").and_then(Value::as_str).unwrap();
        assert_eq!(uuid.len(), 32);
    }

    #[tokio::test]
    async fn it_fetches_device_tags() {
        let client = Arc::new(MockClient::default().with_get_result(
            "device_tag",
            vec![json!({"id": 1, "tag_key": "location", "value": "lab"})],
        ));
        let api = device_api(client.clone(), provisioned());

        let tags = api.fetch_device_tags().await.unwrap();

        assert_eq!(
            tags,
            vec![DeviceTag {
                id: 1,
                name: "location".to_owned(),
                value: "lab".to_owned()
            }]
        );
        assert_eq!(
            client.calls(),
            vec![Call::Get {
                resource: "device_tag".to_owned(),
                options: QueryOptions::default()
                    .filter("device", 42)
                    .select(&["id", "tag_key", "value"]),
            }]
        );
    }

    #[tokio::test]
    async fn it_rejects_malformed_device_tags() {
        let client = Arc::new(MockClient::default().with_get_result(
            "device_tag",
            vec![json!({"id": 1, "tag_key": "location", "value": 3})],
        ));
        let api = device_api(client, provisioned());

        assert!(matches!(
            api.fetch_device_tags().await,
            Err(DeviceApiError::InvalidTag { .. })
        ));
    }

    #[tokio::test]
    async fn it_requires_a_device_id_for_tags() {
        let api = device_api(Arc::new(MockClient::default()), vec![]);

        assert!(matches!(
            api.fetch_device_tags().await,
            Err(DeviceApiError::NotProvisioned(_))
        ));
    }
}
