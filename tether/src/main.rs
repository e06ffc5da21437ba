use std::error::Error;
use std::future::{self, Future};
use std::sync::Arc;

use serde_json::json;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, trace, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod api;
mod cli;
mod device;

use tether_remote as remote;
use tether_util as util;

use crate::api::{ApiState, Listener, LocalAddress};
use crate::cli::Cli;
use crate::device::LocalDevice;
use crate::remote::{
    ApiClient, ApiContext, ConfigError, ConfigKey, ConfigStore, DeviceApi, FileConfigStore,
    HealthMonitor, HttpRegistrar, InitialConfigReporter, InternalInconsistency, PollConfig,
    PollRequest, Provisioner, ProvisioningOptions, Reporter, RequestConfig, TargetPoller,
    TracingSystemLogger, start_poll, start_target_sync, wait_provisioned,
};
use crate::util::dirs::{cache_dir, config_dir};
use crate::util::http::Uri;
use crate::util::types::Uuid;

fn initialize_tracing() {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using
            // RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::default()
                    .add_directive("debug".parse().unwrap())
                    .add_directive("hyper=error".parse().unwrap())
                    .add_directive("reqwest=info".parse().unwrap())
            }),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    initialize_tracing();

    let cli = cli::parse();

    // The config store is the source of truth, CLI arguments are only
    // used to seed it
    let config: Arc<dyn ConfigStore> = Arc::new(FileConfigStore::new(config_dir()));
    seed_config(&cli, config.as_ref()).await?;

    start_agent(cli, config).await
}

/// Store the configuration given on the command line
async fn seed_config(cli: &Cli, config: &dyn ConfigStore) -> Result<(), ConfigError> {
    let stored = config
        .get_many(&[
            ConfigKey::ApiEndpoint,
            ConfigKey::Uuid,
            ConfigKey::ProvisioningOptions,
            ConfigKey::Provisioned,
        ])
        .await?;

    let mut values = vec![(ConfigKey::LocalMode, json!(cli.local_mode))];
    if let Some(api_endpoint) = &cli.api_endpoint {
        values.push((ConfigKey::ApiEndpoint, json!(api_endpoint.to_string())));
    }
    if let Some(interval) = cli.poll_interval {
        values.push((
            ConfigKey::AppUpdatePollInterval,
            json!(interval.as_millis() as u64),
        ));
    }
    if let Some(timeout) = cli.request_timeout {
        values.push((ConfigKey::ApiTimeout, json!(timeout.as_millis() as u64)));
    }
    if let Some(name) = &cli.device_name {
        values.push((ConfigKey::InitialDeviceName, json!(name)));
    }

    let unmanaged = cli.api_endpoint.is_none() && stored.value(ConfigKey::ApiEndpoint).is_none();
    values.push((ConfigKey::Unmanaged, json!(unmanaged)));

    // Keep the identity of an already provisioned device
    let stored_uuid: Option<Uuid> = stored.get(ConfigKey::Uuid)?;
    if let (Some(stored_uuid), Some(uuid)) = (&stored_uuid, &cli.uuid)
        && stored_uuid != uuid
    {
        warn!("ignoring --uuid argument that is different to the stored device uuid");
    }
    let uuid = stored_uuid.or_else(|| cli.uuid.clone()).unwrap_or_default();
    values.push((ConfigKey::Uuid, json!(uuid)));

    if stored.value(ConfigKey::ProvisioningOptions).is_none()
        && let (Some(fleet), Some(device_type)) = (cli.fleet, &cli.device_type)
    {
        let options = ProvisioningOptions {
            uuid,
            // Auto-generate an api key if none provided
            device_api_key: cli.device_api_key.clone().unwrap_or_default(),
            fleet,
            device_type: device_type.clone(),
            os_version: cli.os_version.clone(),
            os_variant: cli.os_variant.clone(),
            supervisor_version: Some(env!("CARGO_PKG_VERSION").to_owned()),
        };
        values.push((ConfigKey::ProvisioningOptions, json!(options)));
    }

    if !stored.flag(ConfigKey::Provisioned)
        && let Some(provisioning_key) = &cli.provisioning_key
    {
        values.push((ConfigKey::ApiKey, json!(provisioning_key)));
    }

    config.set(values).await
}

/// Everything needed to keep the device in sync with the backend
struct Remote {
    context: Arc<ApiContext>,
    provisioner: Provisioner,
    initial_config: InitialConfigReporter,
    reporter: Reporter,
    poller: Arc<TargetPoller>,
    poll_config: PollConfig,
}

#[instrument(name = "tether", skip_all, err)]
async fn start_agent(cli: Cli, config: Arc<dyn ConfigStore>) -> Result<(), Box<dyn Error>> {
    let device = Arc::new(LocalDevice::new());
    let context = Arc::new(ApiContext::new());

    // Set-up channels to trigger polls and target updates
    let (poll_request_tx, poll_request_rx) = watch::channel(PollRequest::default());
    let (target_tx, target_rx) = mpsc::channel(8);

    let conf = config
        .get_many(&[ConfigKey::Unmanaged, ConfigKey::ApiEndpoint])
        .await?;
    let remote = if conf.flag(ConfigKey::Unmanaged) {
        warn!("no API endpoint provided, running in unmanaged mode");
        if conf.value(ConfigKey::ApiEndpoint).is_none() {
            // report the initial config again if the device joins a backend
            config.remove(ConfigKey::InitialConfigReported).await?;
        }
        None
    } else {
        Some(prepare_remote(&cli, config.clone(), context.clone(), device.clone()).await?)
    };

    let mut health = HealthMonitor::new(config.clone(), device.clone());
    let provisioned = remote
        .as_ref()
        .map(|remote| remote.provisioner.subscribe());
    if let Some(remote) = &remote {
        device.report_to(remote.reporter.handle());
        health = health
            .with_report(remote.reporter.handle().status())
            .with_target(remote.poller.clone());
    }

    // Try to bind to the API port first, this will avoid doing an extra poll
    // if the local port is taken
    let listener = match cli.local_api_address {
        LocalAddress::Tcp(socket_addr) => Listener::Tcp(TcpListener::bind(socket_addr).await?),
        LocalAddress::Unix(ref path) => Listener::Unix(UnixListener::bind(path)?),
    };
    debug!("bound to local address {}", cli.local_api_address);

    let api_state = ApiState {
        device: device.clone(),
        health: Arc::new(health),
        context: context.clone(),
        config: config.clone(),
        poll_request_tx,
        device_api: remote
            .as_ref()
            .map(|_| Arc::new(DeviceApi::new(context.clone(), config.clone()))),
    };

    // Start main loop and terminate on error
    tokio::select! {
        // Start local API server
        _ = api::start(listener, api_state) => Ok(()),

        // Start target state synchronization once the device has an identity
        _ = async {
            if let Some(provisioned) = provisioned {
                wait_provisioned(provisioned).await;
            }
            start_target_sync(device.clone(), target_rx, Arc::new(TracingSystemLogger)).await
        } => Ok(()),

        // Provision the device and keep it in sync with the backend
        res = maybe_start(remote, |remote| {
            start_remote(remote, poll_request_rx, target_tx)
        }) => res,
    }
}

/// Create the backend client and the services using it
async fn prepare_remote(
    cli: &Cli,
    config: Arc<dyn ConfigStore>,
    context: Arc<ApiContext>,
    device: Arc<LocalDevice>,
) -> Result<Remote, Box<dyn Error>> {
    let conf = config
        .get_many(&[
            ConfigKey::ApiEndpoint,
            ConfigKey::Uuid,
            ConfigKey::ProvisioningOptions,
            ConfigKey::ApiTimeout,
            ConfigKey::AppUpdatePollInterval,
        ])
        .await?;

    let api_endpoint: Uri = conf
        .get(ConfigKey::ApiEndpoint)?
        .ok_or_else(|| InternalInconsistency::new("managed device without an API endpoint"))?;
    let options: ProvisioningOptions = conf
        .get(ConfigKey::ProvisioningOptions)?
        .ok_or_else(|| {
            InternalInconsistency::new("managed device without provisioning options")
        })?;
    let uuid: Uuid = conf.get(ConfigKey::Uuid)?.unwrap_or(options.uuid.clone());

    let request_defaults = RequestConfig::default();
    let timeout = conf
        .duration(ConfigKey::ApiTimeout)
        .unwrap_or(request_defaults.timeout);
    let poll_config = PollConfig {
        interval: conf
            .duration(ConfigKey::AppUpdatePollInterval)
            .ok_or_else(|| InternalInconsistency::new("invalid target poll interval"))?,
        max_jitter: request_defaults.poll_max_jitter,
    };
    trace!(uuid = %uuid, endpoint = %api_endpoint, "using remote:");

    // Requests to the backend use the key of the device itself
    let client = ApiClient::new(
        api_endpoint.clone(),
        options.device_api_key.clone(),
        timeout,
    )?;
    context.init_client(Arc::new(client))?;

    let poller = Arc::new(
        TargetPoller::new(
            api_endpoint.clone(),
            &uuid,
            options.device_api_key.clone(),
            timeout,
        )?
        .with_cache_dir(cache_dir()),
    );
    if poller.restore_cache().await.is_some() {
        debug!("restored target state from cache");
    }

    let provisioner = Provisioner::new(
        context.clone(),
        config.clone(),
        Arc::new(HttpRegistrar::new(api_endpoint, timeout)),
    );
    let initial_config = InitialConfigReporter::new(
        context.clone(),
        config.clone(),
        device.clone(),
        poller.clone(),
    );
    let reporter = Reporter::new(
        &context,
        device,
        config,
        cli.min_report_interval
            .unwrap_or(request_defaults.report_min_interval),
    )?;

    Ok(Remote {
        context,
        provisioner,
        initial_config,
        reporter,
        poller,
        poll_config,
    })
}

/// Provision the device and then start polling and reporting
async fn start_remote(
    remote: Remote,
    poll_request_rx: watch::Receiver<PollRequest>,
    target_tx: mpsc::Sender<remote::TargetUpdate>,
) -> Result<(), Box<dyn Error>> {
    remote.provisioner.provision().await?;
    remote.initial_config.report_if_needed().await?;

    info!("startup complete, ready for updates");
    remote.context.set_ready_for_updates();

    tokio::select! {
        res = remote.reporter.run() => res.map_err(|err| err.into()),
        _ = start_poll(remote.poller, remote.poll_config, poll_request_rx, target_tx) => Ok(()),
    }
}

/// Given an optional value `pred`, invoke closure `f` if it is `Some(P)`
/// and return the result, otherwise return a pending future in its place.
///
/// This is useful to reduce boilerplate in our main loop `select!`.
async fn maybe_start<P, F, Fut, T>(pred: Option<P>, f: F) -> T
where
    Fut: Future<Output = T>,
    F: FnOnce(P) -> Fut,
{
    match pred {
        Some(p) => f(p).await,
        None => future::pending().await,
    }
}
