//! In-memory (single process) coordination store for local development and
//! tests. Leases expire on the tokio clock, so paused-time tests can drive
//! expiry deterministically.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use vipd_store::{
    CoordinationStore, KeyValue, LeaseId, LeaseKeeper, WatchEvent, WatchEventKind, WatchStream,
};

const WATCH_CAPACITY: usize = 1024;

type Batch = Arc<Vec<WatchEvent>>;

#[derive(Debug)]
struct Entry {
    value: Bytes,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    unavailable: bool,
}

impl State {
    const fn check_available(&self) -> Result<(), Error> {
        if self.unavailable {
            Err(Error::Unavailable)
        } else {
            Ok(())
        }
    }

    fn insert(
        &mut self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
    ) -> Result<WatchEvent, Error> {
        if let Some(id) = lease {
            self.leases
                .get_mut(&id)
                .ok_or(Error::LeaseNotFound(id))?
                .keys
                .insert(key.to_string());
        }

        let previous = self
            .entries
            .insert(key.to_string(), Entry { value, lease });

        if let Some(old_lease) = previous.and_then(|entry| entry.lease)
            && Some(old_lease) != lease
            && let Some(old) = self.leases.get_mut(&old_lease)
        {
            old.keys.remove(key);
        }

        Ok(WatchEvent {
            kind: WatchEventKind::Put,
            key: key.to_string(),
        })
    }

    fn remove(&mut self, key: &str) -> Option<WatchEvent> {
        let entry = self.entries.remove(key)?;

        if let Some(lease) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }

        Some(WatchEvent {
            kind: WatchEventKind::Delete,
            key: key.to_string(),
        })
    }

    fn drop_lease(&mut self, id: LeaseId) -> Vec<WatchEvent> {
        let Some(lease) = self.leases.remove(&id) else {
            return Vec::new();
        };

        lease
            .keys
            .into_iter()
            .filter_map(|key| {
                self.entries.remove(&key).map(|_| WatchEvent {
                    kind: WatchEventKind::Delete,
                    key,
                })
            })
            .collect()
    }
}

fn publish(events: &broadcast::Sender<Batch>, batch: Vec<WatchEvent>) {
    if !batch.is_empty() {
        // No receivers is fine: nobody is watching.
        let _ = events.send(Arc::new(batch));
    }
}

/// In-memory coordination store.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<Batch>,
    breaker: broadcast::Sender<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a new, empty `MemoryStore`.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        let (breaker, _) = broadcast::channel(1);

        Self {
            state: Arc::new(Mutex::new(State {
                next_lease: 1,
                ..State::default()
            })),
            events,
            breaker,
        }
    }

    /// Makes every subsequent operation fail with [`Error::Unavailable`]
    /// until called again with `false`.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Fails every open watch stream with [`Error::WatchBroken`].
    pub fn break_watches(&self) {
        let _ = self.breaker.send(());
    }

    /// Expires a lease immediately, as if its TTL elapsed.
    pub async fn expire_lease(&self, id: LeaseId) {
        let batch = self.state.lock().await.drop_lease(id);
        publish(&self.events, batch);
    }

    /// Whether a lease is currently alive.
    pub async fn has_lease(&self, id: LeaseId) -> bool {
        self.state.lock().await.leases.contains_key(&id)
    }

    /// Number of leases currently alive.
    pub async fn lease_count(&self) -> usize {
        self.state.lock().await.leases.len()
    }

    fn spawn_expiry(&self, id: LeaseId) {
        let state: Weak<Mutex<State>> = Arc::downgrade(&self.state);
        let events = self.events.clone();

        tokio::spawn(async move {
            loop {
                let Some(strong) = state.upgrade() else {
                    return;
                };

                let deadline = match strong.lock().await.leases.get(&id) {
                    Some(lease) => lease.deadline,
                    None => return,
                };
                drop(strong);

                tokio::time::sleep_until(deadline).await;

                let Some(strong) = state.upgrade() else {
                    return;
                };
                let mut guard = strong.lock().await;

                let expired = guard
                    .leases
                    .get(&id)
                    .is_some_and(|lease| lease.deadline <= Instant::now());

                if expired {
                    let batch = guard.drop_lease(id);
                    drop(guard);
                    debug!(lease = id, keys = batch.len(), "lease expired");
                    publish(&events, batch);
                }
            }
        });
    }
}

/// Keeps a [`MemoryStore`] lease alive.
#[derive(Debug)]
pub struct MemoryLeaseKeeper {
    store: MemoryStore,
    lease: LeaseId,
}

#[async_trait]
impl LeaseKeeper for MemoryLeaseKeeper {
    type Error = Error;

    async fn keep_alive(&mut self) -> Result<Duration, Self::Error> {
        let mut state = self.store.state.lock().await;
        state.check_available()?;

        Ok(state.leases.get_mut(&self.lease).map_or(Duration::ZERO, |lease| {
            lease.deadline = Instant::now() + lease.ttl;
            lease.ttl
        }))
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    type Error = Error;
    type Keeper = MemoryLeaseKeeper;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, Self::Error> {
        let state = self.state.lock().await;
        state.check_available()?;

        Ok(state.entries.get(key).map(|entry| KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            lease: entry.lease,
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, Self::Error> {
        let state = self.state.lock().await;
        state.check_available()?;

        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
                lease: entry.lease,
            })
            .collect())
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
    ) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let event = state.insert(key, value, lease)?;
        drop(state);
        publish(&self.events, vec![event]);

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let event = state.remove(key);
        drop(state);

        let existed = event.is_some();
        publish(&self.events, event.into_iter().collect());

        Ok(existed)
    }

    async fn create(
        &self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
    ) -> Result<bool, Self::Error> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        if state.entries.contains_key(key) {
            return Ok(false);
        }

        let event = state.insert(key, value, lease)?;
        drop(state);
        publish(&self.events, vec![event]);

        Ok(true)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, Self::Error> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        drop(state);

        self.spawn_expiry(id);

        Ok(id)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        if !state.leases.contains_key(&lease) {
            return Err(Error::LeaseNotFound(lease));
        }

        let batch = state.drop_lease(lease);
        drop(state);
        publish(&self.events, batch);

        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Self::Keeper, Self::Error> {
        let state = self.state.lock().await;
        state.check_available()?;

        if !state.leases.contains_key(&lease) {
            return Err(Error::LeaseNotFound(lease));
        }

        Ok(MemoryLeaseKeeper {
            store: self.clone(),
            lease,
        })
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream<Self::Error>, Self::Error> {
        self.state.lock().await.check_available()?;

        let events = self.events.subscribe();
        let breaker = self.breaker.subscribe();
        let prefix = prefix.to_string();

        let stream = futures::stream::unfold(
            Some((events, breaker, prefix)),
            |subscription| async move {
                let (mut events, mut breaker, prefix) = subscription?;

                loop {
                    tokio::select! {
                        _ = breaker.recv() => return Some((Err(Error::WatchBroken), None)),
                        batch = events.recv() => match batch {
                            Ok(batch) => {
                                let matching: Vec<WatchEvent> = batch
                                    .iter()
                                    .filter(|event| event.key.starts_with(&prefix))
                                    .cloned()
                                    .collect();

                                if !matching.is_empty() {
                                    return Some((Ok(matching), Some((events, breaker, prefix))));
                                }
                            }
                            Err(RecvError::Lagged(missed)) => {
                                return Some((Err(Error::WatchLagged(missed)), None));
                            }
                            Err(RecvError::Closed) => return None,
                        },
                    }
                }
            },
        );

        Ok(stream.boxed())
    }
}
