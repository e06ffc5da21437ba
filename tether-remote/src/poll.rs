use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{Span, debug, field, info, instrument, trace, warn};

use crate::client::ApiError;
use crate::target::{TargetSource, TargetUpdate};
use crate::util::crypto::sha256_hex_digest;
use crate::util::fs::safe_write_all;
use crate::util::http::Uri;
use crate::util::types::{ApiKey, Uuid};

/// A request for an immediate poll
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollRequest {
    pub force: bool,
    pub is_from_api: bool,
}

/// Poll timing
#[derive(Clone, Copy, Debug)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_jitter: Duration,
}

/// Response of a target state fetch
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// The target state, from the cache if it was not modified
    pub value: Value,
    /// Whether the backend returned a new target state
    pub modified: bool,
}

/// Cache entry for storing etag and value pairs
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    etag: String,
    value: Value,
}

#[derive(Default)]
struct PollState {
    etag: Option<String>,
    cached: Option<Value>,
}

/// Fetches the device target state from the backend
///
/// Uses the ETag of the last response to avoid downloading an unchanged
/// target. The last response is also stored on disk so the next start can
/// skip the download as well.
pub struct TargetPoller {
    client: Client,
    endpoint: Uri,
    api_key: ApiKey,
    cache_path: Option<PathBuf>,
    state: tokio::sync::Mutex<PollState>,
    last_fetch: Mutex<Option<Instant>>,
}

impl TargetPoller {
    pub fn new(
        api_endpoint: Uri,
        uuid: &Uuid,
        api_key: ApiKey,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let endpoint = Uri::from_parts(api_endpoint, &format!("/device/v2/{uuid}/state"), None)?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            cache_path: None,
            state: tokio::sync::Mutex::new(PollState::default()),
            last_fetch: Mutex::new(None),
        })
    }

    /// Keep the last target state in the given directory
    pub fn with_cache_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let digest = sha256_hex_digest(self.endpoint.to_string());
        self.cache_path = Some(dir.as_ref().join(format!("{digest}.json")));
        self
    }

    /// Restore the cached target state, if one exists
    pub async fn restore_cache(&self) -> Option<Value> {
        let cache_path = self.cache_path.as_ref()?;
        let entry = match tokio::fs::read_to_string(cache_path).await {
            Ok(contents) => match serde_json::from_str::<CacheEntry>(&contents) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("failed to deserialize cache from {}: {e}", cache_path.display());
                    return None;
                }
            },
            Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound) => return None,
            Err(e) => {
                warn!("failed to read cache from {}: {e}", cache_path.display());
                return None;
            }
        };

        let mut state = self.state.lock().await;
        state.etag = Some(entry.etag);
        state.cached = Some(entry.value.clone());
        Some(entry.value)
    }

    async fn save_cache(&self, entry: &CacheEntry) {
        let Some(cache_path) = &self.cache_path else {
            return;
        };

        let res = async {
            if let Some(parent) = cache_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let contents = serde_json::to_vec(entry)?;
            safe_write_all(cache_path, contents).await?;
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        if let Err(e) = res {
            warn!("failed to write cache to {}: {e}", cache_path.display());
        }
    }

    /// Fetch the target state
    #[instrument(level = "debug", skip_all, fields(response = field::Empty), err(level = "warn"))]
    pub async fn fetch(&self) -> Result<FetchResponse, ApiError> {
        let mut state = self.state.lock().await;

        let mut request = self
            .client
            .get(self.endpoint.to_string())
            .bearer_auth(self.api_key.as_str())
            .header("Accept-Encoding", "br, gzip, deflate");
        if let Some(etag) = &state.etag {
            request = request.header("If-None-Match", etag);
        }

        let response = request.send().await?;
        let status = response.status();
        Span::current().record("response", field::display(status));

        let res = match status {
            StatusCode::NOT_MODIFIED if state.cached.is_some() => FetchResponse {
                value: state.cached.clone().unwrap_or_default(),
                modified: false,
            },
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get("etag")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                let body = response.bytes().await?;
                let value: Value = serde_json::from_slice(&body)?;

                state.cached = Some(value.clone());
                state.etag = etag.clone();
                if let Some(etag) = etag {
                    self.save_cache(&CacheEntry {
                        etag,
                        value: value.clone(),
                    })
                    .await;
                }

                FetchResponse {
                    value,
                    modified: true,
                }
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                return Err(ApiError::Status {
                    code: status.as_u16(),
                    message,
                });
            }
        };

        if let Ok(mut last_fetch) = self.last_fetch.lock() {
            *last_fetch = Some(Instant::now());
        }
        Ok(res)
    }
}

#[async_trait]
impl TargetSource for TargetPoller {
    async fn get(&self) -> Result<Value, ApiError> {
        self.fetch().await.map(|res| res.value)
    }

    fn last_fetch(&self) -> Option<Instant> {
        self.last_fetch.lock().ok().and_then(|last| *last)
    }
}

/// Time until the next poll, with a random jitter added
pub fn next_poll(config: &PollConfig) -> Duration {
    let jitter_ms = rand::random_range(0..=config.max_jitter.as_millis() as u64);
    config.interval + Duration::from_millis(jitter_ms)
}

/// Poll the target state, sending every new target on the channel
///
/// A request on the `requests` channel triggers an immediate poll. Forced
/// requests re-send the target even if it did not change.
#[instrument(name = "poll", skip_all)]
pub async fn start_poll(
    poller: Arc<TargetPoller>,
    config: PollConfig,
    mut requests: watch::Receiver<PollRequest>,
    updates: mpsc::Sender<TargetUpdate>,
) {
    info!("starting target state poll");
    let mut next_poll_time = Instant::now();
    // the first target is always delivered, the device may not have seen
    // the cached one
    let mut delivered = false;
    loop {
        let request = tokio::select! {
            _ = tokio::time::sleep_until(next_poll_time) => PollRequest::default(),
            changed = requests.changed() => {
                if changed.is_err() {
                    trace!("request channel closed");
                    break;
                }
                let request = *requests.borrow_and_update();
                request
            }
        };

        match poller.fetch().await {
            Ok(res) if res.modified || request.force || !delivered => {
                debug!("new target state");
                let update = TargetUpdate {
                    target: res.value,
                    force: request.force,
                    is_from_api: request.is_from_api,
                };
                if updates.send(update).await.is_err() {
                    trace!("target channel closed");
                    break;
                }
                delivered = true;
            }
            Ok(_) => trace!("target state not modified"),
            Err(e) => warn!("poll failed: {e}"),
        }

        // Reset the poll interval to avoid busy waiting
        next_poll_time = Instant::now() + next_poll(&config);
    }
}
