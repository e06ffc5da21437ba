use clap::Parser;
use std::num::ParseIntError;
use std::time::Duration;

use crate::api::LocalAddress;
use crate::util::http::Uri;
use crate::util::types::{ApiKey, Uuid};

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Unique identifier for this device
    #[arg(env = "TETHER_UUID", long = "uuid", value_name = "uuid")]
    pub uuid: Option<Uuid>,

    /// Local API listen address
    #[arg(
        env = "TETHER_LOCAL_API_ADDRESS",
        long = "local-api-address",
        value_name = "addr",
        default_value_t
    )]
    pub local_api_address: LocalAddress,

    /// Fleet backend endpoint URI. Without it the agent runs in unmanaged mode
    #[arg(env = "TETHER_API_ENDPOINT", long = "api-endpoint", value_name = "uri")]
    pub api_endpoint: Option<Uri>,

    /// API key for the device to authenticate with the backend once registered
    ///
    /// A random key is generated if none is given.
    #[arg(
        env = "TETHER_DEVICE_API_KEY",
        long = "device-api-key",
        value_name = "key",
        requires = "api_endpoint"
    )]
    pub device_api_key: Option<ApiKey>,

    /// Provisioning key used to register the device with the fleet
    #[arg(
        env = "TETHER_PROVISIONING_KEY",
        long = "provisioning-key",
        value_name = "key",
        requires = "api_endpoint",
        requires = "fleet",
        requires = "device_type"
    )]
    pub provisioning_key: Option<ApiKey>,

    /// ID of the fleet to provision this device into
    #[arg(
        env = "TETHER_FLEET",
        long = "fleet",
        value_name = "int",
        requires = "device_type"
    )]
    pub fleet: Option<u64>,

    /// Device type slug
    #[arg(
        env = "TETHER_DEVICE_TYPE",
        long = "device-type",
        value_name = "slug",
        requires = "fleet"
    )]
    pub device_type: Option<String>,

    /// Host OS version, eg. "6.5.39+rev1"
    #[arg(env = "TETHER_OS_VERSION", long = "os-version", value_name = "str")]
    pub os_version: Option<String>,

    /// Host OS variant, eg. "prod"
    #[arg(env = "TETHER_OS_VARIANT", long = "os-variant", value_name = "str")]
    pub os_variant: Option<String>,

    /// Name to give the device on its first report
    #[arg(env = "TETHER_DEVICE_NAME", long = "device-name", value_name = "str")]
    pub device_name: Option<String>,

    /// Target state poll interval in milliseconds
    #[arg(
        env = "TETHER_POLL_INTERVAL_MS",
        long = "poll-interval-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub poll_interval: Option<Duration>,

    /// Backend request timeout in milliseconds
    #[arg(
        env = "TETHER_REQUEST_TIMEOUT_MS",
        long = "request-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub request_timeout: Option<Duration>,

    /// Minimum time between two state reports in milliseconds
    #[arg(
        env = "TETHER_MIN_REPORT_INTERVAL_MS",
        long = "min-report-interval-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub min_report_interval: Option<Duration>,

    /// Only report the device status that is not managed locally
    #[arg(env = "TETHER_LOCAL_MODE", long = "local-mode")]
    pub local_mode: bool,
}

pub fn parse() -> Cli {
    Parser::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn it_has_a_valid_command() {
        Cli::command().debug_assert();
    }

    #[test]
    fn it_requires_fleet_and_device_type_to_provision() {
        let res = Cli::try_parse_from([
            "tether",
            "--api-endpoint",
            "https://api.example.com",
            "--provisioning-key",
            "secret",
        ]);
        assert!(res.is_err());

        let cli = Cli::try_parse_from([
            "tether",
            "--api-endpoint",
            "https://api.example.com",
            "--provisioning-key",
            "secret",
            "--fleet",
            "123",
            "--device-type",
            "raspberrypi4-64",
            "--poll-interval-ms",
            "60000",
        ])
        .unwrap();
        assert_eq!(cli.fleet, Some(123));
        assert_eq!(cli.poll_interval, Some(Duration::from_secs(60)));
        assert!(!cli.local_mode);
    }
}
