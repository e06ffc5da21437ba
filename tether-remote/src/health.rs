use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{ConfigKey, ConfigStore};
use crate::device::DeviceState;
use crate::report::ReportStatus;
use crate::target::TargetSource;

/// Consecutive report failures after which a connected device is unhealthy
const MAX_REPORT_ERRORS: u32 = 3;

/// Liveness check for the agent
///
/// Reads the progress of the target poll and the state report. The only
/// state of its own is its creation time, which stands in for the last
/// target fetch until there is one.
pub struct HealthMonitor {
    started: Instant,
    config: Arc<dyn ConfigStore>,
    device: Arc<dyn DeviceState>,
    report: Option<Arc<ReportStatus>>,
    target: Option<Arc<dyn TargetSource>>,
}

impl HealthMonitor {
    pub fn new(config: Arc<dyn ConfigStore>, device: Arc<dyn DeviceState>) -> Self {
        Self {
            started: Instant::now(),
            config,
            device,
            report: None,
            target: None,
        }
    }

    pub fn with_report(self, report: Arc<ReportStatus>) -> Self {
        Self {
            report: Some(report),
            ..self
        }
    }

    pub fn with_target(self, target: Arc<dyn TargetSource>) -> Self {
        Self {
            target: Some(target),
            ..self
        }
    }

    pub async fn healthcheck(&self) -> bool {
        let conf = match self
            .config
            .get_many(&[
                ConfigKey::AppUpdatePollInterval,
                ConfigKey::Unmanaged,
                ConfigKey::ConnectivityCheckEnabled,
            ])
            .await
        {
            Ok(conf) => conf,
            Err(e) => {
                warn!("healthcheck failure - could not read config: {e}");
                return false;
            }
        };

        if conf.flag(ConfigKey::Unmanaged) {
            return true;
        }

        let Some(poll_interval) = conf.duration(ConfigKey::AppUpdatePollInterval) else {
            info!(
                "healthcheck failure - config value `appUpdatePollInterval` is not a valid duration"
            );
            return false;
        };

        let last_fetch = self
            .target
            .as_ref()
            .and_then(|target| target.last_fetch())
            .map_or(self.started, |last| last.max(self.started));
        let since_fetch = Instant::now().saturating_duration_since(last_fetch);
        if since_fetch >= poll_interval.saturating_mul(2) {
            info!(
                "healthcheck failure - device has not fetched target state within appUpdatePollInterval limit"
            );
            return false;
        }

        let connectivity_check = conf.flag(ConfigKey::ConnectivityCheckEnabled);
        let connected = self.device.connected();
        let report_errors = self
            .report
            .as_ref()
            .map(|report| report.consecutive_errors())
            .unwrap_or_default();
        if connectivity_check && connected && report_errors >= MAX_REPORT_ERRORS {
            info!(
                connectivity_check,
                connected, report_errors, "healthcheck failure - state report is failing"
            );
            return false;
        }

        true
    }
}
