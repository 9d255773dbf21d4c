//! Registry of the endpoint managers running on this host.

use crate::manager::{EndpointManager, EndpointStatus};
use crate::{Error, ManagerConfig, Storage};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use vipd_locks::{DistributedLock, LeaseLock};
use vipd_model::Endpoint;
use vipd_plugin::Registry;
use vipd_store::{CoordinationStore, LeaseId};

/// Owns one [`EndpointManager`] per locally configured endpoint and allows at
/// most one manager per election key.
pub struct Scheduler<S, L = LeaseLock<S>> {
    storage: Storage<S>,
    lock: L,
    registry: Registry,
    config: ManagerConfig,
    host_lease: Option<watch::Receiver<Option<LeaseId>>>,
    managers: RwLock<HashMap<String, Arc<EndpointManager>>>,
}

impl<S, L> std::fmt::Debug for Scheduler<S, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, L> Scheduler<S, L>
where
    S: CoordinationStore,
    L: DistributedLock,
{
    /// Creates a scheduler with no endpoints.
    pub fn new(storage: Storage<S>, lock: L, registry: Registry, config: ManagerConfig) -> Self {
        Self {
            storage,
            lock,
            registry,
            config,
            host_lease: None,
            managers: RwLock::new(HashMap::new()),
        }
    }

    /// Writes link records under the host lease published by `lease`.
    #[must_use]
    pub fn with_host_lease(mut self, lease: watch::Receiver<Option<LeaseId>>) -> Self {
        self.host_lease = Some(lease);
        self
    }

    /// The storage endpoints are persisted in.
    pub const fn storage(&self) -> &Storage<S> {
        &self.storage
    }

    async fn manager(&self, id: &str) -> Result<Arc<EndpointManager>, Error> {
        self.managers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn current_host_lease(&self) -> Option<LeaseId> {
        self.host_lease.as_ref().and_then(|lease| *lease.borrow())
    }

    async fn link(&self, election_key: &str) {
        let Some(lease) = self.current_host_lease() else {
            debug!(%election_key, "no host lease, skipping link record");
            return;
        };

        if let Err(e) = self.storage.put_link(election_key, lease).await {
            warn!(%election_key, error = %e, "failed to write link record");
        }
    }

    async fn unlink(&self, election_key: &str) {
        if let Err(e) = self.storage.remove_link(election_key).await {
            warn!(%election_key, error = %e, "failed to remove link record");
        }
    }

    async fn validate(&self, endpoint: &Endpoint) -> Result<(), Error> {
        self.registry
            .get(&endpoint.plugin)?
            .validate(endpoint)
            .await
            .map_err(Error::from)
    }

    /// Starts a manager for an already persisted endpoint.
    ///
    /// # Errors
    ///
    /// - [`Error::PluginNotFound`] if the endpoint names an unknown plugin.
    /// - [`Error::Conflict`] if a running endpoint uses the same election key.
    /// - [`Error::AlreadyExists`] if the endpoint is already running.
    /// - [`Error::InvalidConfig`] if the manager configuration has a zero
    ///   interval or timeout.
    #[instrument(skip_all, fields(endpoint_id = %endpoint.id))]
    pub async fn start(&self, endpoint: Endpoint) -> Result<(), Error> {
        self.config.validate()?;
        let plugin_name = self.registry.resolve_name(&endpoint.plugin).to_string();
        let plugin = self.registry.get(&plugin_name)?.create(&endpoint).await?;
        let election_key = plugin.election_key();

        {
            let mut managers = self.managers.write().await;

            if managers.contains_key(&endpoint.id) {
                return Err(Error::AlreadyExists(endpoint.id));
            }

            if let Some(existing) = managers
                .values()
                .find(|manager| manager.election_key() == election_key)
            {
                return Err(Error::Conflict {
                    election_key,
                    endpoint_id: existing.id().to_string(),
                });
            }

            let id = endpoint.id.clone();
            let manager = EndpointManager::start(
                endpoint,
                plugin_name.as_str(),
                plugin,
                self.lock.clone(),
                self.config.clone(),
            );
            managers.insert(id, Arc::new(manager));
        }

        info!(%election_key, plugin = %plugin_name, "endpoint started");
        self.link(&election_key).await;

        Ok(())
    }

    /// Stops and forgets an endpoint's manager. The stored record is kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no manager runs for `id`.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> Result<(), Error> {
        let manager = self
            .managers
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        manager.stop().await;
        self.unlink(manager.election_key()).await;

        info!("endpoint stopped");
        Ok(())
    }

    /// Status of every running endpoint, ordered by id.
    pub async fn status(&self) -> Vec<EndpointStatus> {
        let mut statuses: Vec<_> = self
            .managers
            .read()
            .await
            .values()
            .map(|manager| manager.status())
            .collect();

        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Status of one running endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no manager runs for `id`.
    pub async fn endpoint_status(&self, id: &str) -> Result<EndpointStatus, Error> {
        Ok(self.manager(id).await?.status())
    }

    /// Configuration of every running endpoint, ordered by id.
    pub async fn configured_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<_> = self
            .managers
            .read()
            .await
            .values()
            .map(|manager| manager.endpoint())
            .collect();

        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        endpoints
    }

    /// Configuration of one running endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no manager runs for `id`.
    pub async fn get_endpoint(&self, id: &str) -> Result<Endpoint, Error> {
        Ok(self.manager(id).await?.endpoint())
    }

    /// Persists new configuration and hands it to the running manager.
    /// Health checks change immediately; plugin settings apply the next time
    /// the endpoint starts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no manager runs for the endpoint,
    /// [`Error::Conflict`] if the new plugin settings compete under another
    /// running endpoint's election key, or a plugin error if the new
    /// configuration is rejected.
    #[instrument(skip_all, fields(endpoint_id = %endpoint.id))]
    pub async fn update_endpoint(&self, endpoint: Endpoint) -> Result<(), Error> {
        let manager = self.manager(&endpoint.id).await?;
        self.validate(&endpoint).await?;

        let current = manager.endpoint();
        if endpoint.plugin != current.plugin || endpoint.plugin_config != current.plugin_config {
            let election_key = self
                .registry
                .get(&endpoint.plugin)?
                .create(&endpoint)
                .await?
                .election_key();

            if let Some(existing) = self
                .managers
                .read()
                .await
                .values()
                .find(|other| other.id() != endpoint.id && other.election_key() == election_key)
            {
                return Err(Error::Conflict {
                    election_key,
                    endpoint_id: existing.id().to_string(),
                });
            }
        }

        self.storage.put_endpoint(&endpoint).await?;
        manager.update_endpoint(endpoint);

        info!("endpoint updated");
        Ok(())
    }

    /// Makes the endpoint step down so a peer can take over.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no manager runs for `id`.
    #[instrument(skip(self))]
    pub async fn failover(&self, id: &str) -> Result<(), Error> {
        self.manager(id).await?.failover().await
    }

    /// Validates, persists and starts a new endpoint. An empty id is replaced
    /// with a generated one. Nothing stays persisted if the start fails.
    ///
    /// # Errors
    ///
    /// Returns plugin, conflict or store errors; see [`Scheduler::start`].
    pub async fn add_endpoint(&self, mut endpoint: Endpoint) -> Result<Endpoint, Error> {
        if endpoint.id.is_empty() {
            endpoint.id = Endpoint::generate_id();
        }

        self.validate(&endpoint).await?;
        self.storage.add_endpoint(&endpoint).await?;

        if let Err(e) = self.start(endpoint.clone()).await {
            if let Err(rollback) = self.storage.remove_endpoint(&endpoint.id).await {
                warn!(endpoint_id = %endpoint.id, error = %rollback, "failed to roll back endpoint record");
            }
            return Err(e);
        }

        Ok(endpoint)
    }

    /// Deletes an endpoint's record and stops its manager.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the endpoint is neither stored nor
    /// running.
    #[instrument(skip(self))]
    pub async fn remove_endpoint(&self, id: &str) -> Result<(), Error> {
        let running = self.managers.read().await.contains_key(id);
        let stored = self.storage.remove_endpoint(id).await?;

        if !running && !stored {
            return Err(Error::NotFound(id.to_string()));
        }

        match self.stop(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("endpoint was not running"),
            Err(e) => return Err(e),
        }

        info!("endpoint removed");
        Ok(())
    }

    /// Starts every endpoint persisted for this host. Returns how many
    /// started; failures are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored endpoints cannot be listed.
    pub async fn restore(&self) -> Result<usize, Error> {
        let endpoints = self.storage.list_endpoints().await?;
        let total = endpoints.len();
        let mut started = 0;

        for endpoint in endpoints {
            let id = endpoint.id.clone();
            match self.start(endpoint).await {
                Ok(()) => started += 1,
                Err(e) => warn!(endpoint_id = %id, error = %e, "failed to restore endpoint"),
            }
        }

        info!(started, total, "endpoints restored");
        Ok(started)
    }

    /// Rewrites every link record under `lease`.
    pub async fn relink(&self, lease: LeaseId) {
        let keys: Vec<String> = self
            .managers
            .read()
            .await
            .values()
            .map(|manager| manager.election_key().to_string())
            .collect();

        for key in keys {
            if let Err(e) = self.storage.put_link(&key, lease).await {
                warn!(election_key = %key, error = %e, "failed to rewrite link record");
            }
        }

        debug!(lease_id = lease, "link records rewritten");
    }

    /// Rewrites link records each time the host lease is replaced, until
    /// `shutdown_token` fires.
    pub async fn follow_host_lease(&self, shutdown_token: CancellationToken) {
        let Some(mut lease) = self.host_lease.clone() else {
            return;
        };

        loop {
            tokio::select! {
                () = shutdown_token.cancelled() => return,
                changed = lease.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }

            let current = *lease.borrow_and_update();
            if let Some(current) = current {
                self.relink(current).await;
            }
        }
    }

    /// Stops every manager.
    pub async fn shutdown(&self) {
        let managers: Vec<_> = self
            .managers
            .write()
            .await
            .drain()
            .map(|(_, manager)| manager)
            .collect();

        futures::future::join_all(managers.iter().map(|manager| manager.stop())).await;

        info!(count = managers.len(), "all endpoints stopped");
    }
}
