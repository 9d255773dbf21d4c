use crate::Result;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vipd_locks::{LeaseLock, LeaseLockConfig};
use vipd_manager::{HostLease, ManagerConfig, Scheduler, Storage};
use vipd_model::KeyLayout;
use vipd_plugin::Registry;
use vipd_plugin_arp::{ArpFactory, SystemRunner};
use vipd_plugin_mock::MockFactory;
use vipd_serializer::Serializer;
use vipd_store::CoordinationStore;

/// Registers this host, restores its endpoints and runs them until
/// `shutdown_token` fires. Startup store failures are returned; anything
/// after that is handled by the managers themselves.
pub async fn run<S>(
    store: S,
    config: ManagerConfig,
    layout: KeyLayout,
    default_plugin: String,
    shutdown_token: CancellationToken,
) -> Result<()>
where
    S: CoordinationStore,
{
    config.validate()?;
    info!(hostname = %config.hostname, root = %layout.root(), "starting vipd");

    let storage = Storage::new(
        store.clone(),
        layout.clone(),
        config.hostname.clone(),
        config.store_timeout,
    );
    let host_lease = HostLease::start(storage.clone(), config.lease_ttl()).await?;

    let lock = LeaseLock::new(
        store,
        LeaseLockConfig {
            layout,
            holder: config.hostname.clone(),
            operation_timeout: config.store_timeout,
        },
    );

    // Every system command from every endpoint goes through this one queue.
    let commands = Serializer::start(SystemRunner::default());
    let registry = Registry::new(default_plugin)
        .with(Arc::new(ArpFactory::new(commands.clone())))
        .with(Arc::new(MockFactory::new()));
    info!(plugins = ?registry.names(), "plugins registered");

    let scheduler = Arc::new(
        Scheduler::new(storage, lock, registry, config).with_host_lease(host_lease.subscribe()),
    );

    if let Err(e) = scheduler.restore().await {
        host_lease.stop().await;
        commands.stop().await;
        return Err(e.into());
    }

    let relink_token = shutdown_token.child_token();
    let relinker = tokio::spawn({
        let scheduler = scheduler.clone();
        let relink_token = relink_token.clone();
        async move { scheduler.follow_host_lease(relink_token).await }
    });

    shutdown_token.cancelled().await;
    info!("shutting down");

    relink_token.cancel();
    if let Err(e) = relinker.await {
        warn!(error = %e, "link maintenance task failed");
    }

    scheduler.shutdown().await;
    host_lease.stop().await;
    commands.stop().await;

    Ok(())
}
