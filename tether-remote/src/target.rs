use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, instrument, trace};

use crate::client::ApiError;
use crate::device::{ApplyOpts, DeviceState, SetTargetError};

/// Prefix of the first system message on a rejected target
const REJECTION_PREFIX: &str = "Could not move to new release: ";

/// A target state received from the backend
#[derive(Clone, Debug, PartialEq)]
pub struct TargetUpdate {
    pub target: Value,
    pub force: bool,
    pub is_from_api: bool,
}

/// Where target states come from
#[async_trait]
pub trait TargetSource: Send + Sync {
    /// Fetch the current target state from the backend
    async fn get(&self) -> Result<Value, ApiError>;

    /// When the target state was last fetched successfully
    fn last_fetch(&self) -> Option<Instant>;
}

/// Sink for messages meant to be read by the device operator
pub trait SystemLogger: Send + Sync {
    fn log_system_message(&self, message: &str, event: &str);
}

/// System logger writing to the `system` tracing target
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSystemLogger;

impl SystemLogger for TracingSystemLogger {
    fn log_system_message(&self, message: &str, event: &str) {
        info!(target: "system", event, "{message}");
    }
}

/// Hand a target state to the device and request it to be applied
///
/// If the device rejects the target the current target keeps running.
pub async fn apply_target(
    device: &dyn DeviceState,
    logger: &dyn SystemLogger,
    update: TargetUpdate,
) {
    match device.set_target(update.target).await {
        Ok(()) => device.trigger_apply_target(ApplyOpts {
            force: update.force,
            is_from_api: update.is_from_api,
        }),
        Err(
            e @ (SetTargetError::ContractValidation(_) | SetTargetError::ContractViolation(_)),
        ) => {
            error!("could not store target state for device: {e}");
            // multi-line messages are not displayed correctly, send every
            // line separately
            let message = e.to_string();
            for (i, line) in message.lines().enumerate() {
                let line = if i == 0 {
                    format!("{REJECTION_PREFIX}{line}")
                } else {
                    line.to_owned()
                };
                logger.log_system_message(&line, "targetStateRejection");
            }
        }
        Err(e) => error!("failed to set target state for device: {e}"),
    }
}

/// Apply every target state received on the channel
#[instrument(name = "target", skip_all)]
pub async fn start_target_sync(
    device: Arc<dyn DeviceState>,
    mut updates: mpsc::Receiver<TargetUpdate>,
    logger: Arc<dyn SystemLogger>,
) {
    info!("waiting for target states");
    while let Some(update) = updates.recv().await {
        trace!(force = update.force, "received target state");
        apply_target(device.as_ref(), logger.as_ref(), update).await;
    }
    trace!("target channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLogger(Mutex<Vec<(String, String)>>);

    impl SystemLogger for RecordingLogger {
        fn log_system_message(&self, message: &str, event: &str) {
            self.0
                .lock()
                .unwrap()
                .push((message.to_owned(), event.to_owned()));
        }
    }

    fn update(force: bool) -> TargetUpdate {
        TargetUpdate {
            target: json!({"local": {"config": {}}}),
            force,
            is_from_api: true,
        }
    }

    #[tokio::test]
    async fn it_applies_accepted_targets() {
        let device = MockDevice::default();
        let logger = RecordingLogger::default();

        apply_target(&device, &logger, update(true)).await;

        assert_eq!(*device.targets.lock().unwrap(), vec![update(true).target]);
        assert_eq!(
            *device.applied.lock().unwrap(),
            vec![ApplyOpts {
                force: true,
                is_from_api: true
            }]
        );
        assert!(logger.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn it_logs_every_line_of_a_rejection() {
        let device = MockDevice::default();
        *device.reject_with.lock().unwrap() = Some(SetTargetError::ContractViolation);
        let logger = RecordingLogger::default();

        apply_target(&device, &logger, update(false)).await;

        assert!(device.applied.lock().unwrap().is_empty());
        assert_eq!(
            *logger.0.lock().unwrap(),
            vec![
                (
                    "Could not move to new release: target rejected".to_owned(),
                    "targetStateRejection".to_owned()
                ),
                (
                    "second line".to_owned(),
                    "targetStateRejection".to_owned()
                ),
            ]
        );
    }

    #[tokio::test]
    async fn it_does_not_notify_other_failures() {
        let device = MockDevice::default();
        *device.reject_with.lock().unwrap() = Some(|msg| SetTargetError::Other(msg.into()));
        let logger = RecordingLogger::default();

        apply_target(&device, &logger, update(false)).await;

        assert!(device.applied.lock().unwrap().is_empty());
        assert!(logger.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn it_applies_targets_from_the_channel() {
        let device = Arc::new(MockDevice::default());
        let (tx, rx) = mpsc::channel(4);

        tx.send(update(false)).await.unwrap();
        tx.send(update(true)).await.unwrap();
        drop(tx);

        start_target_sync(device.clone(), rx, Arc::new(TracingSystemLogger)).await;

        assert_eq!(device.applied.lock().unwrap().len(), 2);
    }
}
