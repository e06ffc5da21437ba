use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::client::{ApiError, BackendClient};
use crate::config::{ConfigError, ConfigKey, ConfigStore, RequestConfig};
use crate::context::ApiContext;
use crate::device::{DeviceState, DeviceStateError, DeviceStatus};
use crate::diff::diff;
use crate::error::InternalInconsistency;
use crate::local_mode::strip_for_local_mode;
use crate::throttle::Throttle;
use crate::util::json::duration_from_ms_value;
use crate::util::types::Uuid;

/// Delay after the first failed report
pub const MINIMUM_BACKOFF_DELAY: Duration = Duration::from_secs(15);

/// Delay before retrying after `errors` consecutive failures
///
/// Doubles with every failure and never goes over `max`.
pub fn backoff_delay(errors: u32, max: Duration) -> Duration {
    MINIMUM_BACKOFF_DELAY
        .saturating_mul(2u32.saturating_pow(errors))
        .min(max)
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Inconsistency(#[from] InternalInconsistency),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceStateError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ReportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReportError::Inconsistency(_))
    }
}

/// Progress of the reporter, shared with whoever needs to observe it
#[derive(Debug, Default)]
pub struct ReportStatus {
    in_flight: AtomicBool,
    consecutive_errors: AtomicU32,
    /// A notification was dropped while a cycle was running
    missed: AtomicBool,
}

impl ReportStatus {
    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Acquire)
    }

    /// Mark a cycle as started. Returns false if one is already running
    fn try_begin(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    fn take_missed(&self) -> bool {
        self.missed.swap(false, Ordering::AcqRel)
    }

    fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::Release);
    }

    /// Count a failure, returning the count before this one
    pub(crate) fn record_failure(&self) -> u32 {
        self.consecutive_errors.fetch_add(1, Ordering::AcqRel)
    }
}

/// Handle given to the device state to signal changes
#[derive(Clone)]
pub struct ReportHandle {
    status: Arc<ReportStatus>,
    wake: Arc<Notify>,
}

impl ReportHandle {
    /// Let the reporter know the device state has changed
    ///
    /// Notifications arriving while a report cycle is running are coalesced,
    /// the running cycle picks up the new state before it finishes.
    pub fn notify_state_changed(&self) {
        if self.status.try_begin() {
            self.wake.notify_one();
        } else {
            trace!("report in progress, skipping notification");
            self.status.missed.store(true, Ordering::Release);
        }
    }

    pub fn status(&self) -> Arc<ReportStatus> {
        self.status.clone()
    }
}

/// Result of a single report attempt
#[derive(Debug, PartialEq)]
enum Outcome {
    /// The backend accepted the given body
    Sent(DeviceStatus),
    /// The throttle is closed until the given time
    Throttled(Instant),
    /// Nothing was left to send after filtering
    Skipped,
}

/// Owner of the state report convergence loop
pub struct Reporter {
    client: Arc<dyn BackendClient>,
    device: Arc<dyn DeviceState>,
    config: Arc<dyn ConfigStore>,
    throttle: Throttle,
    status: Arc<ReportStatus>,
    wake: Arc<Notify>,
    state_for_report: DeviceStatus,
    last_reported: DeviceStatus,
}

impl Reporter {
    pub fn new(
        context: &ApiContext,
        device: Arc<dyn DeviceState>,
        config: Arc<dyn ConfigStore>,
        min_interval: Duration,
    ) -> Result<Self, InternalInconsistency> {
        let client = context.client("start state reporting")?;
        Ok(Self {
            client,
            device,
            config,
            throttle: Throttle::new(min_interval),
            status: Arc::new(ReportStatus::default()),
            wake: Arc::new(Notify::new()),
            state_for_report: DeviceStatus::default(),
            last_reported: DeviceStatus::default(),
        })
    }

    pub fn handle(&self) -> ReportHandle {
        ReportHandle {
            status: self.status.clone(),
            wake: self.wake.clone(),
        }
    }

    /// Report the current state and then keep reporting on every change
    ///
    /// This only returns if reporting can no longer continue.
    #[instrument(name = "report", skip_all, err)]
    pub async fn run(mut self) -> Result<(), ReportError> {
        if self.status.try_begin() {
            self.converge().await?;
        }

        info!("waiting for state changes");
        loop {
            self.wake.notified().await;
            self.converge().await?;
        }
    }

    /// Run a report cycle until the backend has seen the latest state
    async fn converge(&mut self) -> Result<(), ReportError> {
        let res = self.converge_inner().await;
        self.status.finish();

        // changes notified after the last snapshot need another cycle
        if res.is_ok() && self.status.take_missed() && self.status.try_begin() {
            trace!("state changed at the end of the cycle");
            self.wake.notify_one();
        }
        res
    }

    async fn converge_inner(&mut self) -> Result<(), ReportError> {
        loop {
            // the snapshot below covers every notification until now
            self.status.take_missed();
            let res = match self.device.status().await {
                Ok(snapshot) => {
                    self.state_for_report.merge(&snapshot);
                    let changes = diff(&self.state_for_report, &self.last_reported);
                    if changes.is_empty() {
                        trace!("nothing to report");
                        return Ok(());
                    }
                    self.report(&changes).await
                }
                Err(e) => Err(e.into()),
            };

            match res {
                Ok(Outcome::Sent(body)) => {
                    self.last_reported.merge(&body);
                    self.status.record_success();
                    debug!("state reported");
                }
                Ok(Outcome::Throttled(until)) => {
                    trace!("report throttled");
                    tokio::time::sleep_until(until).await;
                }
                Ok(Outcome::Skipped) => {
                    debug!("local mode enabled, skipping report");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    match &e {
                        ReportError::Api(ApiError::Status { .. }) => {
                            warn!("state report rejected: {e}")
                        }
                        _ => error!("state report failed: {e}"),
                    }
                    let max = self.max_backoff().await;
                    let delay = backoff_delay(self.status.record_failure(), max);
                    info!("retrying report in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Attempt to send a state patch through the throttle
    async fn report(&mut self, changes: &DeviceStatus) -> Result<Outcome, ReportError> {
        let conf = self
            .config
            .get_many(&[
                ConfigKey::ApiTimeout,
                ConfigKey::Uuid,
                ConfigKey::LocalMode,
                ConfigKey::ApiEndpoint,
            ])
            .await?;

        let uuid: Uuid = conf
            .string(ConfigKey::Uuid)
            .ok_or_else(|| InternalInconsistency::new("no device uuid to report state for"))?
            .into();
        if conf.string(ConfigKey::ApiEndpoint).is_none() {
            return Err(InternalInconsistency::new("no API endpoint to report state to").into());
        }
        let timeout = conf
            .duration(ConfigKey::ApiTimeout)
            .unwrap_or_else(|| RequestConfig::default().timeout);

        let body = if conf.flag(ConfigKey::LocalMode) {
            let filtered = strip_for_local_mode(changes);
            if filtered.local.is_empty() {
                return Ok(Outcome::Skipped);
            }
            filtered
        } else {
            changes.clone()
        };

        let now = Instant::now();
        if !self.throttle.try_acquire(now) {
            let until = self.throttle.next_allowed().unwrap_or(now);
            return Ok(Outcome::Throttled(until));
        }

        tokio::time::timeout(timeout, self.client.patch_state(&uuid, &body))
            .await
            .map_err(|_| ApiError::Timeout(timeout))??;

        Ok(Outcome::Sent(body))
    }

    /// Longest delay between retries, the target poll interval
    async fn max_backoff(&self) -> Duration {
        let key = ConfigKey::AppUpdatePollInterval;
        let value = match self.config.get(key).await {
            Ok(value) => value,
            Err(e) => {
                debug!("could not read poll interval: {e}");
                None
            }
        };
        value
            .as_ref()
            .and_then(duration_from_ms_value)
            .or_else(|| key.default_value().as_ref().and_then(duration_from_ms_value))
            .unwrap_or(MINIMUM_BACKOFF_DELAY)
    }
}
