//! Abstract interface for the coordination store vipd elects through.
//!
//! A store provides a flat key space with prefix reads, leases that expire
//! unless kept alive, an atomic create-if-absent, and prefix watches.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Identifier of a lease granted by the store.
pub type LeaseId = i64;

/// Marker trait for store errors.
pub trait StoreError: Debug + Error + Send + Sync + 'static {
    /// Whether retrying the same call later may succeed.
    fn is_retriable(&self) -> bool;
}

/// A key with its current value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    /// The full key.
    pub key: String,

    /// The stored value.
    pub value: Bytes,

    /// The lease the key is bound to, if any.
    pub lease: Option<LeaseId>,
}

/// What happened to a watched key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    /// The key was created or overwritten.
    Put,

    /// The key was deleted, explicitly or by lease expiry.
    Delete,
}

/// One change observed on a watched prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened.
    pub kind: WatchEventKind,

    /// The key it happened to.
    pub key: String,
}

/// Stream of change batches. An `Err` item means the subscription broke and
/// must be re-established.
pub type WatchStream<E> = BoxStream<'static, Result<Vec<WatchEvent>, E>>;

/// Keeps one lease alive.
#[async_trait]
pub trait LeaseKeeper: Send + 'static {
    /// The error type for keep-alive operations.
    type Error: StoreError;

    /// Sends one keep-alive and returns the TTL the store now reports.
    ///
    /// A zero TTL means the lease no longer exists.
    async fn keep_alive(&mut self) -> Result<Duration, Self::Error>;
}

/// A trait representing a coordination store with asynchronous operations.
#[async_trait]
pub trait CoordinationStore: Clone + Send + Sync + 'static {
    /// The error type for store operations.
    type Error: StoreError;

    /// The keeper type returned by [`CoordinationStore::keep_alive`].
    type Keeper: LeaseKeeper<Error = Self::Error>;

    /// Reads a single key.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, Self::Error>;

    /// Reads every key starting with `prefix`, ordered by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, Self::Error>;

    /// Writes a key, optionally bound to a lease.
    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>)
    -> Result<(), Self::Error>;

    /// Deletes a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, Self::Error>;

    /// Atomically writes `key` only if it does not exist. Returns whether the
    /// write happened.
    async fn create(
        &self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
    ) -> Result<bool, Self::Error>;

    /// Grants a new lease with the given TTL.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, Self::Error>;

    /// Revokes a lease, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), Self::Error>;

    /// Opens a keep-alive channel for a lease.
    async fn keep_alive(&self, lease: LeaseId) -> Result<Self::Keeper, Self::Error>;

    /// Subscribes to changes of every key starting with `prefix`.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream<Self::Error>, Self::Error>;
}
