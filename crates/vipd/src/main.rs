//! VIP failover daemon: keeps each configured endpoint active on exactly one
//! healthy host, coordinating through etcd.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod daemon;
mod error;

use error::{Error, Result};

use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vipd_manager::ManagerConfig;
use vipd_model::KeyLayout;
use vipd_store_etcd::{EtcdStore, EtcdStoreConfig};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// etcd endpoints, comma separated
    #[arg(
        long,
        env = "VIPD_ETCD_ENDPOINTS",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:2379"
    )]
    etcd_endpoints: Vec<String>,

    #[arg(long, env = "VIPD_ETCD_USER", requires = "etcd_password")]
    etcd_user: Option<String>,

    #[arg(long, env = "VIPD_ETCD_PASSWORD", requires = "etcd_user")]
    etcd_password: Option<String>,

    /// Root every key lives under
    #[arg(long, env = "VIPD_KEY_PREFIX", default_value = "/vipd")]
    key_prefix: String,

    /// Identity of this host; falls back to HOSTNAME
    #[arg(long, env = "VIPD_HOSTNAME")]
    hostname: Option<String>,

    /// Lease keep-alive period; leases live twice as long
    #[arg(long, env = "VIPD_KEEPALIVE_INTERVAL", default_value = "3s", value_parser = parse_interval)]
    keepalive_interval: Duration,

    #[arg(long, env = "VIPD_HEALTHCHECK_INTERVAL", default_value = "5s", value_parser = parse_interval)]
    healthcheck_interval: Duration,

    #[arg(long, env = "VIPD_HEALTHCHECK_TIMEOUT", default_value = "2s", value_parser = parse_interval)]
    healthcheck_timeout: Duration,

    /// Reconciliation period while active
    #[arg(long, env = "VIPD_ENSURE_INTERVAL", default_value = "10s", value_parser = parse_interval)]
    ensure_interval: Duration,

    /// Bound on a single coordination store call
    #[arg(long, env = "VIPD_STORE_TIMEOUT", default_value = "5s", value_parser = parse_interval)]
    store_timeout: Duration,

    /// Bound on a single activation or deactivation hook
    #[arg(long, env = "VIPD_HOOK_TIMEOUT", default_value = "30s", value_parser = parse_interval)]
    hook_timeout: Duration,

    /// Plugin for endpoints that do not name one
    #[arg(long, env = "VIPD_DEFAULT_PLUGIN", default_value = vipd_plugin::DEFAULT_PLUGIN)]
    default_plugin: String,

    /// Log as JSON lines
    #[arg(long, env = "VIPD_LOG_JSON", default_value_t = false)]
    log_json: bool,
}

/// Parses a human readable duration that tokio timers can run with.
fn parse_interval(value: &str) -> std::result::Result<Duration, String> {
    let duration = humantime::parse_duration(value).map_err(|e| e.to_string())?;
    if duration.is_zero() {
        return Err("must be greater than zero".to_string());
    }
    Ok(duration)
}

impl Args {
    fn hostname(&self) -> Result<String> {
        self.hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|hostname| !hostname.is_empty())
            .ok_or(Error::MissingHostname)
    }

    fn manager_config(&self) -> Result<ManagerConfig> {
        Ok(ManagerConfig {
            hostname: self.hostname()?,
            keepalive_interval: self.keepalive_interval,
            healthcheck_interval: self.healthcheck_interval,
            healthcheck_timeout: self.healthcheck_timeout,
            ensure_interval: self.ensure_interval,
            store_timeout: self.store_timeout,
            hook_timeout: self.hook_timeout,
        })
    }

    fn etcd_config(&self) -> EtcdStoreConfig {
        EtcdStoreConfig {
            endpoints: self.etcd_endpoints.clone(),
            credentials: self.etcd_user.clone().zip(self.etcd_password.clone()),
            operation_timeout: Some(self.store_timeout),
            max_retries: None,
            retry_base_delay: None,
            retry_max_delay: None,
        }
    }
}

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
    .map_err(Error::Logging)
}

async fn wait_for_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| Error::Io("failed to install SIGTERM handler", e))?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| Error::Io("failed to listen for SIGINT", e))?;
            info!("received SIGINT");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_json)?;

    let config = args.manager_config()?;
    let layout = KeyLayout::new(args.key_prefix.clone());
    let store = EtcdStore::connect(args.etcd_config()).await?;

    let shutdown_token = CancellationToken::new();
    let daemon = daemon::run(
        store,
        config,
        layout,
        args.default_plugin.clone(),
        shutdown_token.clone(),
    );
    tokio::pin!(daemon);

    tokio::select! {
        result = &mut daemon => return result,
        signal = wait_for_signal() => {
            shutdown_token.cancel();
            signal?;
        }
    }

    daemon.await?;
    info!("vipd stopped");

    Ok(())
}
