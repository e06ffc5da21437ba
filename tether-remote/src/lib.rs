/*
This crate is home to everything related to the fleet backend managing the
device we're running on.

It provides tools to register the device with the backend, pin it to a
release, report the initial configuration, poll for new target states and
report the device status while it converges to them. Every request obeys the
backend constraints on frequency and backs off when the backend fails.
*/

pub mod client;
pub mod config;
pub mod context;
pub mod device;
pub mod device_api;
pub mod diff;
pub mod error;
pub mod health;
pub mod initial_config;
pub mod local_mode;
pub mod poll;
pub mod provisioning;
pub mod register;
pub mod report;
pub mod target;
pub mod throttle;

#[cfg(test)]
mod mock;

pub use client::{ApiClient, ApiError, BackendClient, QueryOptions};
pub use config::{ConfigError, ConfigKey, ConfigStore, FileConfigStore, RequestConfig};
pub use context::ApiContext;
pub use device::{ApplyOpts, DeviceState, DeviceStateError, DeviceStatus, SetTargetError};
pub use device_api::{DeviceApi, DeviceApiError, DeviceTag};
pub use error::InternalInconsistency;
pub use health::HealthMonitor;
pub use initial_config::{InitialConfigError, InitialConfigReporter};
pub use poll::{PollConfig, PollRequest, TargetPoller, start_poll};
pub use provisioning::{Provisioner, ProvisioningError, wait_provisioned};
pub use register::{HttpRegistrar, ProvisioningOptions, Registrar};
pub use report::{ReportHandle, ReportStatus, Reporter};
pub use target::{SystemLogger, TargetSource, TargetUpdate, TracingSystemLogger, start_target_sync};

use tether_util as util;
