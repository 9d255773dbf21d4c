use crate::{DistributedLock, Error, Lease, LockStatus, OnChange, Watcher};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use vipd_model::KeyLayout;
use vipd_store::{CoordinationStore, LeaseKeeper};

/// Configuration for the `LeaseLock`.
#[derive(Clone, Debug)]
pub struct LeaseLockConfig {
    /// Where lock keys live.
    pub layout: KeyLayout,

    /// Identity written as the lock value, normally the hostname.
    pub holder: String,

    /// Bound on every individual store call.
    pub operation_timeout: Duration,
}

/// Distributed lock implemented as a create-if-absent key bound to a lease.
#[derive(Clone, Debug)]
pub struct LeaseLock<S> {
    store: S,
    layout: KeyLayout,
    holder: String,
    holder_bytes: Bytes,
    operation_timeout: Duration,
}

impl<S> LeaseLock<S>
where
    S: CoordinationStore,
{
    /// Creates a new lease lock over `store`.
    pub fn new(
        store: S,
        LeaseLockConfig {
            layout,
            holder,
            operation_timeout,
        }: LeaseLockConfig,
    ) -> Self {
        let holder_bytes = Bytes::from(holder.clone());

        Self {
            store,
            layout,
            holder,
            holder_bytes,
            operation_timeout,
        }
    }

    /// The identity this lock writes as holder.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    async fn bounded<T, E>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, E>> + Send,
    ) -> Result<T, Error>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::Store(Box::new(e))),
            Err(_elapsed) => Err(Error::Timeout {
                operation,
                timeout: self.operation_timeout,
            }),
        }
    }

    async fn revoke_quietly(&self, lease_id: i64) {
        if let Err(e) = self
            .bounded("revoke_lease", self.store.revoke_lease(lease_id))
            .await
        {
            debug!(lease_id, error = %e, "failed to revoke unused lease");
        }
    }
}

#[async_trait]
impl<S> DistributedLock for LeaseLock<S>
where
    S: CoordinationStore,
{
    type Error = Error;

    #[instrument(skip(self), fields(holder = %self.holder))]
    async fn check(&self, key: &str) -> Result<LockStatus, Self::Error> {
        let current = self
            .bounded("get", self.store.get(&self.layout.lock(key)))
            .await?;

        Ok(match current {
            None => LockStatus::Free,
            Some(kv) if kv.value == self.holder_bytes => LockStatus::HeldBySelf,
            Some(kv) => LockStatus::HeldByOther(String::from_utf8_lossy(&kv.value).into_owned()),
        })
    }

    #[instrument(skip(self), fields(holder = %self.holder))]
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, Self::Error> {
        if (ttl / 2).is_zero() {
            return Err(Error::InvalidTtl(ttl));
        }

        let lock_key = self.layout.lock(key);
        let lease_id = self
            .bounded("grant_lease", self.store.grant_lease(ttl))
            .await?;

        let created = self
            .bounded(
                "create",
                self.store
                    .create(&lock_key, self.holder_bytes.clone(), Some(lease_id)),
            )
            .await;

        match created {
            Ok(true) => {
                info!(key = %lock_key, lease_id, ?ttl, "lock acquired");
                Ok(Some(Lease { id: lease_id, ttl }))
            }
            Ok(false) => {
                debug!(key = %lock_key, "lock already held");
                self.revoke_quietly(lease_id).await;
                Ok(None)
            }
            Err(e) => {
                // The create may have landed; revoking removes the key with it.
                self.revoke_quietly(lease_id).await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self, cancel), fields(holder = %self.holder, lease_id = lease.id))]
    async fn renew(&self, lease: Lease, cancel: CancellationToken) -> Self::Error {
        let interval = lease.ttl / 2;
        if interval.is_zero() {
            return Error::InvalidTtl(lease.ttl);
        }
        // A keep-alive must not outlast the time left on the lease.
        let attempt_timeout = self.operation_timeout.min(interval);

        let keeper = tokio::select! {
            () = cancel.cancelled() => return Error::Cancelled,
            keeper = self.bounded("keep_alive", self.store.keep_alive(lease.id)) => keeper,
        };
        let mut keeper = match keeper {
            Ok(keeper) => keeper,
            Err(e) => return e,
        };

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Error::Cancelled,
                _ = ticker.tick() => {}
            }

            let sent = tokio::select! {
                () = cancel.cancelled() => return Error::Cancelled,
                sent = tokio::time::timeout(attempt_timeout, keeper.keep_alive()) => sent,
            };

            match sent {
                Ok(Ok(ttl)) if ttl.is_zero() => {
                    warn!("lease no longer exists");
                    return Error::LeaseExpired(lease.id);
                }
                Ok(Ok(ttl)) => trace!(?ttl, "lease renewed"),
                Ok(Err(e)) => {
                    warn!(error = %e, "lease keep-alive failed");
                    return Error::Store(Box::new(e));
                }
                Err(_elapsed) => {
                    warn!(timeout = ?attempt_timeout, "lease keep-alive timed out");
                    return Error::Timeout {
                        operation: "keep_alive",
                        timeout: attempt_timeout,
                    };
                }
            }
        }
    }

    #[instrument(skip(self), fields(holder = %self.holder, lease_id = lease.id))]
    async fn release(&self, key: &str, lease: Lease) -> Result<(), Self::Error> {
        let lock_key = self.layout.lock(key);

        match self
            .bounded("revoke_lease", self.store.revoke_lease(lease.id))
            .await
        {
            Ok(()) => {
                info!(key = %lock_key, "lock released");
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "revoke failed, falling back to conditional delete");

                // Only delete the key if it is still ours.
                let current = self.bounded("get", self.store.get(&lock_key)).await?;
                if let Some(kv) = current
                    && kv.lease == Some(lease.id)
                {
                    self.bounded("delete", self.store.delete(&lock_key)).await?;
                    info!(key = %lock_key, "lock released by delete");
                }

                Ok(())
            }
        }
    }

    fn watch(&self, key: &str, on_change: OnChange) -> Watcher {
        Watcher::start(self.store.clone(), self.layout.lock(key), on_change)
    }
}
