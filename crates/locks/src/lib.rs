//! Lease-backed mutual exclusion on top of a coordination store, and a
//! watcher that reports changes to a lock key.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod lease;
mod watcher;

pub use error::Error;
pub use lease::{LeaseLock, LeaseLockConfig};
pub use watcher::{OnChange, Watcher};

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vipd_store::LeaseId;

/// Marker trait for `DistributedLock` errors
pub trait LockError: Debug + std::error::Error + Send + Sync + 'static {}

/// Represents the current status of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock is free.
    Free,

    /// The lock is held by another host, identified by the String.
    HeldByOther(String),

    /// The lock is held under this host's identity.
    HeldBySelf,
}

/// Handle to a held lock: the lease backing it and that lease's TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// Store lease id.
    pub id: LeaseId,

    /// TTL the lease was granted with.
    pub ttl: Duration,
}

/// A distributed lock whose ownership is tied to a renewable lease.
#[async_trait]
pub trait DistributedLock: Clone + Send + Sync + 'static {
    /// The error type for lock operations.
    type Error: LockError;

    /// Checks the status of a lock.
    async fn check(&self, key: &str) -> Result<LockStatus, Self::Error>;

    /// Attempts to take the lock without waiting.
    ///
    /// Returns `Ok(None)` when someone else holds it. Errors are reserved for
    /// infrastructure failures.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, Self::Error>;

    /// Keeps `lease` alive until it can no longer be renewed or `cancel`
    /// fires. Returns the reason renewal ended; any return means ownership
    /// is gone.
    async fn renew(&self, lease: Lease, cancel: CancellationToken) -> Self::Error;

    /// Gives the lock up. Best-effort: the lease TTL reclaims the key anyway.
    async fn release(&self, key: &str, lease: Lease) -> Result<(), Self::Error>;

    /// Starts watching the lock key, calling `on_change` after every change.
    fn watch(&self, key: &str, on_change: OnChange) -> Watcher;
}
