//! The host-level lease backing this host's record and link records.

use crate::{Error, Storage};

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vipd_model::{DATA_VERSION, Host};
use vipd_store::{CoordinationStore, LeaseId, LeaseKeeper};

const REGRANT_DELAY: Duration = Duration::from_secs(1);

/// Keeps a host lease alive for the life of the process, re-granting it and
/// rewriting the host record whenever it is lost.
#[derive(Debug)]
pub struct HostLease {
    lease: watch::Receiver<Option<LeaseId>>,
    shutdown_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HostLease {
    /// Grants the first lease, writes the host record and starts the keeper.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease cannot be granted or the record written.
    pub async fn start<S>(storage: Storage<S>, ttl: Duration) -> Result<Self, Error>
    where
        S: CoordinationStore,
    {
        match storage.get_host().await? {
            Some(previous) => {
                if previous.needs_migration() {
                    info!(
                        from = previous.data_version,
                        to = DATA_VERSION,
                        "migrating host record"
                    );
                }

                // Links left behind by a previous run should not outlive it.
                if let Err(e) = storage.revoke_lease(previous.lease_id).await {
                    debug!(lease_id = previous.lease_id, error = %e, "previous host lease already gone");
                }
            }
            None => info!(hostname = %storage.hostname(), "registering new host"),
        }

        let lease = register(&storage, ttl).await?;
        let (sender, receiver) = watch::channel(Some(lease));
        let shutdown_token = CancellationToken::new();

        let task = tokio::spawn(keep(storage, ttl, lease, sender, shutdown_token.clone()));

        Ok(Self {
            lease: receiver,
            shutdown_token,
            task: Mutex::new(Some(task)),
        })
    }

    /// The lease currently held, if any.
    #[must_use]
    pub fn current(&self) -> Option<LeaseId> {
        *self.lease.borrow()
    }

    /// Observes lease changes. `None` while a lost lease is being replaced.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<LeaseId>> {
        self.lease.clone()
    }

    /// Stops the keeper. The lease is left to expire so link records vanish
    /// on their own.
    pub async fn stop(&self) {
        self.shutdown_token.cancel();

        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(error = %e, "host lease task panicked");
        }
    }
}

impl Drop for HostLease {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

async fn register<S>(storage: &Storage<S>, ttl: Duration) -> Result<LeaseId, Error>
where
    S: CoordinationStore,
{
    let lease = storage.grant_lease(ttl).await?;
    storage
        .put_host(&Host::new(storage.hostname(), lease))
        .await?;

    info!(lease_id = lease, hostname = %storage.hostname(), "host lease granted");
    Ok(lease)
}

async fn keep<S>(
    storage: Storage<S>,
    ttl: Duration,
    mut lease: LeaseId,
    sender: watch::Sender<Option<LeaseId>>,
    shutdown_token: CancellationToken,
) where
    S: CoordinationStore,
{
    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => return,
            reason = keep_alive(&storage, lease, ttl) => {
                warn!(lease_id = lease, %reason, "host lease lost, re-granting");
            }
        }

        sender.send_replace(None);

        lease = loop {
            let registered = tokio::select! {
                () = shutdown_token.cancelled() => return,
                registered = register(&storage, ttl) => registered,
            };

            match registered {
                Ok(lease) => break lease,
                Err(e) => {
                    warn!(error = %e, "failed to re-grant host lease");
                    tokio::select! {
                        () = shutdown_token.cancelled() => return,
                        () = tokio::time::sleep(REGRANT_DELAY) => {}
                    }
                }
            }
        };

        sender.send_replace(Some(lease));
    }
}

/// Keeps `lease` alive until it cannot be; returns why.
async fn keep_alive<S>(storage: &Storage<S>, lease: LeaseId, ttl: Duration) -> String
where
    S: CoordinationStore,
{
    let interval = ttl / 2;

    let mut keeper = match tokio::time::timeout(interval, storage.store().keep_alive(lease)).await {
        Ok(Ok(keeper)) => keeper,
        Ok(Err(e)) => return e.to_string(),
        Err(_) => return "keep-alive setup timed out".to_string(),
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match tokio::time::timeout(interval, keeper.keep_alive()).await {
            Ok(Ok(remaining)) if remaining.is_zero() => return "lease expired".to_string(),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return e.to_string(),
            Err(_) => return "keep-alive timed out".to_string(),
        }
    }
}
