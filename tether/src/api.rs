use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{Request, Response, StatusCode},
    routing::{get, patch, post},
};
use serde::Deserialize;
use std::fmt::{self, Display};
use std::net::{AddrParseError, IpAddr, Ipv4Addr, SocketAddr};
use std::path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch::Sender;
use tower_http::trace::TraceLayer;
use tracing::{
    Span, debug, debug_span,
    field::{Empty, display},
    info, instrument, warn,
};

use crate::device::{AcceptedTarget, LocalDevice};
use crate::remote::{
    ApiContext, ConfigKey, ConfigStore, DeviceApi, DeviceApiError, DeviceStatus, DeviceTag,
    HealthMonitor, PollRequest,
};

pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Local API listen address
#[derive(Clone, Debug)]
pub enum LocalAddress {
    Tcp(SocketAddr),
    Unix(path::PathBuf),
}

impl Display for LocalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalAddress::Tcp(socket_addr) => socket_addr.fmt(f),
            LocalAddress::Unix(path) => path.as_path().display().fmt(f),
        }
    }
}

impl FromStr for LocalAddress {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(LocalAddress::Tcp)
            .or_else(|_| Ok(LocalAddress::Unix(path::Path::new(s).to_path_buf())))
    }
}

impl Default for LocalAddress {
    fn default() -> Self {
        LocalAddress::Tcp(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            48484,
        ))
    }
}

/// Everything the request handlers need
#[derive(Clone)]
pub struct ApiState {
    pub device: Arc<LocalDevice>,
    pub health: Arc<HealthMonitor>,
    pub context: Arc<ApiContext>,
    pub config: Arc<dyn ConfigStore>,
    pub poll_request_tx: Sender<PollRequest>,
    /// Not available in unmanaged mode
    pub device_api: Option<Arc<DeviceApi>>,
}

/// Start the API
///
/// Receives a listener already bound to the right address
#[instrument(name = "api", skip_all)]
pub async fn start(listener: Listener, state: ApiState) {
    let api_span = Span::current();
    let app = Router::new()
        .route("/v3/ping", get(|| async { "OK" }))
        .route("/v3/device/status", patch(update_device_status))
        .route("/v3/device/target", get(get_device_target))
        .route("/v3/device/tags", get(get_device_tags))
        // Legacy routes
        .route("/v1/healthy", get(healthcheck))
        .route("/v1/update", post(trigger_update));

    // Enable tracing
    let app = app.layer(
        TraceLayer::new_for_http()
            .make_span_with(move |request: &Request<Body>| {
                debug_span!(parent: &api_span, "request",
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                    status = Empty,
                )
            })
            .on_response(|response: &Response<Body>, _: Duration, span: &Span| {
                span.record("status", display(response.status()));
            }),
    );

    let app = app.with_state(state);

    info!("ready");

    let res = match listener {
        Listener::Tcp(listener) => axum::serve(listener, app).await,
        Listener::Unix(listener) => axum::serve(listener, app).await,
    };
    if let Err(e) = res {
        warn!("local API stopped: {e}");
    }
}

/// Handle `GET /v1/healthy`
async fn healthcheck(State(state): State<ApiState>) -> StatusCode {
    if state.health.healthcheck().await {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[derive(Debug, Default, Deserialize)]
struct UpdateOpts {
    #[serde(default)]
    force: bool,
}

/// Handle `POST /v1/update` requests
///
/// Triggers an immediate poll of the target state if instant updates are
/// enabled. Updates before the agent has finished starting up are ignored.
async fn trigger_update(State(state): State<ApiState>, body: Bytes) -> StatusCode {
    if !state.context.ready_for_updates() {
        debug!("ignoring update request before startup completed");
        return StatusCode::ACCEPTED;
    }

    let instant_updates = match state.config.get_many(&[ConfigKey::InstantUpdates]).await {
        Ok(conf) => conf.flag(ConfigKey::InstantUpdates),
        Err(e) => {
            warn!("failed to read config: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };
    if !instant_updates {
        debug!("ignoring update notification because instant updates are disabled");
        return StatusCode::ACCEPTED;
    }

    // Empty or invalid payloads use the defaults
    let opts = serde_json::from_slice::<UpdateOpts>(&body).unwrap_or_default();
    let request = PollRequest {
        force: opts.force,
        is_from_api: true,
    };
    if state.poll_request_tx.send(request).is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    StatusCode::NO_CONTENT
}

/// Handle `PATCH /v3/device/status`
///
/// Merges the given status into the device status
async fn update_device_status(
    State(state): State<ApiState>,
    Json(status): Json<DeviceStatus>,
) -> StatusCode {
    match state.device.update_status(&status) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            warn!("{e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Handle `GET /v3/device/target`
///
/// Returns the target state the device should apply
async fn get_device_target(
    State(state): State<ApiState>,
) -> Result<Json<AcceptedTarget>, StatusCode> {
    state
        .device
        .accepted_target()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Handle `GET /v3/device/tags`
async fn get_device_tags(
    State(state): State<ApiState>,
) -> Result<Json<Vec<DeviceTag>>, StatusCode> {
    let Some(device_api) = state.device_api else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    device_api
        .fetch_device_tags()
        .await
        .map(Json)
        .map_err(|e| match e {
            DeviceApiError::NotProvisioned(_) | DeviceApiError::Unmanaged(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::BAD_GATEWAY,
        })
}
