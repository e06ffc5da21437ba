use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{Span, debug, field, instrument, warn};

use crate::client::{ApiClient, ApiError, BackendClient, QueryOptions};
use crate::util::http::Uri;
use crate::util::types::{ApiKey, DeviceType, Uuid};

/// Everything needed to register the device with a fleet
///
/// The uuid and device key are generated once and stored before the first
/// registration attempt, so every retry registers the same device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningOptions {
    pub uuid: Uuid,
    pub device_api_key: ApiKey,
    pub fleet: u64,
    pub device_type: DeviceType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_variant: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_version: Option<String>,
}

/// Device registration with the backend
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Find the id of an already registered device
    async fn lookup(&self, options: &ProvisioningOptions) -> Result<Option<u64>, ApiError>;

    /// Register the device with the provisioning key, returning its id
    async fn register(
        &self,
        provisioning_key: &ApiKey,
        options: &ProvisioningOptions,
    ) -> Result<u64, ApiError>;
}

/*
    request {
        uuid
        api_key
        application
        device_type
        os_version?
        os_variant?
        supervisor_version?
    }
*/
#[derive(Clone, Debug, Serialize)]
struct RegisterRequest<'a> {
    uuid: &'a Uuid,
    api_key: &'a ApiKey,
    application: u64,
    device_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    os_version: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    os_variant: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    supervisor_version: Option<&'a str>,
}

impl<'a> From<&'a ProvisioningOptions> for RegisterRequest<'a> {
    fn from(value: &'a ProvisioningOptions) -> Self {
        Self {
            uuid: &value.uuid,
            api_key: &value.device_api_key,
            application: value.fleet,
            device_type: &value.device_type,
            os_version: value.os_version.as_deref(),
            os_variant: value.os_variant.as_deref(),
            supervisor_version: value.supervisor_version.as_deref(),
        }
    }
}

/*
    response {
        id: device.id,
        uuid: device.uuid,
        api_key: apiKey,
    };
*/
#[derive(Clone, Debug, Deserialize)]
struct RegisterResponse {
    id: u64,
    uuid: Uuid,
}

#[derive(Deserialize)]
struct DeviceId {
    id: u64,
}

/// Registrar using the backend registration endpoint
#[derive(Clone, Debug)]
pub struct HttpRegistrar {
    client: Client,
    api_endpoint: Uri,
    timeout: Duration,
}

impl HttpRegistrar {
    pub fn new(api_endpoint: Uri, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            api_endpoint,
            timeout,
        }
    }
}

#[async_trait]
impl Registrar for HttpRegistrar {
    #[instrument(skip_all, err)]
    async fn lookup(&self, options: &ProvisioningOptions) -> Result<Option<u64>, ApiError> {
        // the device key only gives access to the device itself
        let client = ApiClient::new(
            self.api_endpoint.clone(),
            options.device_api_key.clone(),
            self.timeout,
        )?;
        let res = client
            .get(
                "device",
                None,
                QueryOptions::default()
                    .filter("uuid", options.uuid.as_str())
                    .select(&["id"]),
            )
            .await;

        // an unknown device key is rejected rather than returning no results
        let devices = match res {
            Err(e) if matches!(e.status(), Some(401 | 403)) => return Ok(None),
            res => res?,
        };

        match devices.into_iter().next() {
            Some(device) => {
                let device: DeviceId = serde_json::from_value(device)?;
                Ok(Some(device.id))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip_all, fields(result=field::Empty), err)]
    async fn register(
        &self,
        provisioning_key: &ApiKey,
        options: &ProvisioningOptions,
    ) -> Result<u64, ApiError> {
        let endpoint = Uri::from_parts(self.api_endpoint.clone(), "/device/register", None)?;
        let request = RegisterRequest::from(options);

        debug!("calling remote");
        let response = self
            .client
            .post(endpoint.to_string())
            .bearer_auth(provisioning_key.as_str())
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        Span::current().record("result", field::display(status));

        if status == reqwest::StatusCode::CONFLICT {
            // the device was registered on a previous attempt
            debug!("device already registered");
            return self.lookup(options).await?.ok_or_else(|| ApiError::Status {
                code: status.as_u16(),
                message: "device exists but could not be found".to_owned(),
            });
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                code: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await?;
        let response: RegisterResponse = serde_json::from_slice(&body)?;
        if response.uuid != options.uuid {
            warn!("registered uuid {} does not match {}", response.uuid, options.uuid);
        }

        Ok(response.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn options() -> ProvisioningOptions {
        ProvisioningOptions {
            uuid: "abc123".into(),
            device_api_key: "device-key".into(),
            fleet: 12,
            device_type: "raspberrypi4-64".to_owned(),
            os_version: Some("6.0.1".to_owned()),
            os_variant: None,
            supervisor_version: None,
        }
    }

    fn registrar(server: &Server) -> HttpRegistrar {
        HttpRegistrar::new(server.url().try_into().unwrap(), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_register_device() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/device/register")
            .match_header("authorization", "Bearer provisioning-key")
            .match_body(Matcher::Json(json!({
                "uuid": "abc123",
                "api_key": "device-key",
                "application": 12,
                "device_type": "raspberrypi4-64",
                "os_version": "6.0.1"
            })))
            .with_status(201)
            .with_body(r#"{"id": 99, "uuid": "abc123", "api_key": "device-key"}"#)
            .create_async()
            .await;

        let id = registrar(&server)
            .register(&"provisioning-key".into(), &options())
            .await
            .unwrap();

        assert_eq!(id, 99);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_register_conflict_looks_up_the_device() {
        let mut server = Server::new_async().await;
        let register = server
            .mock("POST", "/device/register")
            .with_status(409)
            .with_body("\"Unique key constraint violated\"")
            .create_async()
            .await;
        let lookup = server
            .mock("GET", "/v6/device")
            .match_header("authorization", "Bearer device-key")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("$filter".into(), "uuid eq 'abc123'".into()),
                Matcher::UrlEncoded("$select".into(), "id".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"d": [{"id": 77}]}"#)
            .create_async()
            .await;

        let id = registrar(&server)
            .register(&"provisioning-key".into(), &options())
            .await
            .unwrap();

        assert_eq!(id, 77);
        register.assert_async().await;
        lookup.assert_async().await;
    }

    #[tokio::test]
    async fn test_register_failure_status() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/device/register")
            .with_status(401)
            .with_body("Unauthorized")
            .create_async()
            .await;

        let err = registrar(&server)
            .register(&"bad-key".into(), &options())
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(401));
    }

    #[tokio::test]
    async fn test_lookup_unknown_device() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v6/device")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"d": []}"#)
            .create_async()
            .await;

        let id = registrar(&server).lookup(&options()).await.unwrap();
        assert_eq!(id, None);
    }

    #[tokio::test]
    async fn test_lookup_with_unknown_device_key() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v6/device")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let id = registrar(&server).lookup(&options()).await.unwrap();
        assert_eq!(id, None);
    }

    #[test]
    fn it_stores_options_without_empty_fields() {
        let mut opts = options();
        opts.os_version = None;

        assert_eq!(
            serde_json::to_value(&opts).unwrap(),
            json!({
                "uuid": "abc123",
                "device_api_key": "device-key",
                "fleet": 12,
                "device_type": "raspberrypi4-64"
            })
        );
    }
}
