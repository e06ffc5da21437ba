use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{Span, field, instrument, trace};

use crate::device::DeviceStatus;
use crate::util::http::{InvalidUriError, Uri};
use crate::util::types::{ApiKey, Uuid};

/// Prefix of the resource API
const RESOURCE_API_PREFIX: &str = "/v6";

#[derive(Debug, Error)]
pub enum ApiError {
    /// The backend replied with a non-success status
    #[error("server replied with status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid endpoint URI: {0}")]
    Uri(#[from] InvalidUriError),
}

impl ApiError {
    /// Status code of a non-success response, if that is what this is
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Selection and filtering for resource queries
///
/// Filters are combined with `and`, string values are quoted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOptions {
    pub select: Vec<String>,
    pub filter: Vec<(String, Value)>,
}

impl QueryOptions {
    pub fn select(mut self, fields: &[&str]) -> Self {
        self.select = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn filter(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filter.push((field.to_owned(), value.into()));
        self
    }

    fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if !self.filter.is_empty() {
            let clauses: Vec<String> = self
                .filter
                .iter()
                .map(|(field, value)| match value {
                    Value::String(s) => format!("{field} eq '{}'", s.replace('\'', "''")),
                    other => format!("{field} eq {other}"),
                })
                .collect();
            query.push(("$filter", clauses.join(" and ")));
        }
        if !self.select.is_empty() {
            query.push(("$select", self.select.join(",")));
        }
        query
    }
}

/// The fleet backend as seen by the agent
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Query a resource collection, or a single resource when `id` is given
    async fn get(
        &self,
        resource: &str,
        id: Option<u64>,
        options: QueryOptions,
    ) -> Result<Vec<Value>, ApiError>;

    /// Create a resource, returning the created entity
    async fn post(&self, resource: &str, body: Value) -> Result<Value, ApiError>;

    /// Update fields of a resource
    async fn patch(&self, resource: &str, id: u64, body: Value) -> Result<(), ApiError>;

    /// Report a state patch for the device
    async fn patch_state(&self, uuid: &Uuid, body: &DeviceStatus) -> Result<(), ApiError>;
}

#[derive(Deserialize)]
struct Collection {
    d: Vec<Value>,
}

/// HTTP client for the fleet backend
///
/// Created once at startup and shared.
#[derive(Clone, Debug)]
pub struct ApiClient {
    client: Client,
    api_endpoint: Uri,
    api_key: ApiKey,
}

impl ApiClient {
    pub fn new(api_endpoint: Uri, api_key: ApiKey, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_endpoint,
            api_key,
        })
    }

    fn resource_uri(&self, resource: &str, id: Option<u64>) -> Result<String, ApiError> {
        let path = match id {
            Some(id) => format!("{RESOURCE_API_PREFIX}/{resource}({id})"),
            None => format!("{RESOURCE_API_PREFIX}/{resource}"),
        };
        Ok(Uri::from_parts(self.api_endpoint.clone(), &path, None)?.to_string())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = request
            .bearer_auth(self.api_key.as_str())
            .header("Accept-Encoding", "br, gzip, deflate")
            .send()
            .await?;

        let status = response.status();
        Span::current().record("response", field::display(status));
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                code: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl BackendClient for ApiClient {
    #[instrument(level = "debug", skip(self, options), fields(response = field::Empty), err(level = "warn"))]
    async fn get(
        &self,
        resource: &str,
        id: Option<u64>,
        options: QueryOptions,
    ) -> Result<Vec<Value>, ApiError> {
        let endpoint = self.resource_uri(resource, id)?;
        let request = self.client.get(endpoint).query(&options.to_query());
        let body = self.send(request).await?.bytes().await?;
        let collection: Collection = serde_json::from_slice(&body)?;
        Ok(collection.d)
    }

    #[instrument(level = "debug", skip(self, body), fields(response = field::Empty), err(level = "warn"))]
    async fn post(&self, resource: &str, body: Value) -> Result<Value, ApiError> {
        let endpoint = self.resource_uri(resource, None)?;
        let request = self.client.post(endpoint).json(&body);
        let body = self.send(request).await?.bytes().await?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&body)?)
    }

    #[instrument(level = "debug", skip(self, body), fields(response = field::Empty), err(level = "warn"))]
    async fn patch(&self, resource: &str, id: u64, body: Value) -> Result<(), ApiError> {
        let endpoint = self.resource_uri(resource, Some(id))?;
        let request = self.client.patch(endpoint).json(&body);
        self.send(request).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(response = field::Empty), err(level = "warn"))]
    async fn patch_state(&self, uuid: &Uuid, body: &DeviceStatus) -> Result<(), ApiError> {
        let endpoint = Uri::from_parts(
            self.api_endpoint.clone(),
            &format!("/device/v2/{uuid}/state"),
            None,
        )?;
        trace!("sending state patch to {endpoint}");
        let request = self.client.patch(endpoint.to_string()).json(body);
        self.send(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    async fn client_for(server: &Server) -> ApiClient {
        let endpoint: Uri = server.url().try_into().unwrap();
        ApiClient::new(endpoint, "device-key".into(), Duration::from_secs(10)).unwrap()
    }

    #[tokio::test]
    async fn test_patch_state_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PATCH", "/device/v2/abc123/state")
            .match_header("authorization", "Bearer device-key")
            .match_body(Matcher::Json(json!({"local": {"is_online": true}})))
            .with_status(200)
            .create_async()
            .await;

        let client = client_for(&server).await;
        let body: DeviceStatus =
            serde_json::from_value(json!({"local": {"is_online": true}})).unwrap();
        client
            .patch_state(&Uuid::from("abc123"), &body)
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_patch_state_non_success_status() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PATCH", "/device/v2/abc123/state")
            .with_status(503)
            .with_body("try later")
            .create_async()
            .await;

        let client = client_for(&server).await;
        let res = client
            .patch_state(&Uuid::from("abc123"), &DeviceStatus::default())
            .await;

        match res {
            Err(ApiError::Status { code, message }) => {
                assert_eq!(code, 503);
                assert_eq!(message, "try later");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_with_select_and_filter() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v6/release")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded(
                    "$filter".into(),
                    "belongs_to__application eq 12 and commit eq 'abcdef'".into(),
                ),
                Matcher::UrlEncoded("$select".into(), "id".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"d": [{"id": 42}]}"#)
            .create_async()
            .await;

        let client = client_for(&server).await;
        let releases = client
            .get(
                "release",
                None,
                QueryOptions::default()
                    .filter("belongs_to__application", 12)
                    .filter("commit", "abcdef")
                    .select(&["id"]),
            )
            .await
            .unwrap();

        assert_eq!(releases, vec![json!({"id": 42})]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_patch_resource_by_id() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PATCH", "/v6/device(7)")
            .match_body(Matcher::Json(json!({"device_name": "kiosk"})))
            .with_status(200)
            .create_async()
            .await;

        let client = client_for(&server).await;
        client
            .patch("device", 7, json!({"device_name": "kiosk"}))
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_returns_created_entity() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v6/device_config_variable")
            .match_body(Matcher::PartialJson(json!({"name": "RESIN_FOO"})))
            .with_status(201)
            .with_body(r#"{"id": 3, "name": "RESIN_FOO"}"#)
            .create_async()
            .await;

        let client = client_for(&server).await;
        let created = client
            .post(
                "device_config_variable",
                json!({"device": 1, "name": "RESIN_FOO", "value": "bar"}),
            )
            .await
            .unwrap();

        assert_eq!(created.get("id"), Some(&json!(3)));
        mock.assert_async().await;
    }

    #[test]
    fn it_quotes_string_filters() {
        let query = QueryOptions::default()
            .filter("uuid", "it's")
            .filter("status", "success")
            .to_query();

        assert_eq!(
            query,
            vec![("$filter", "uuid eq 'it''s' and status eq 'success'".to_string())]
        );
    }
}
