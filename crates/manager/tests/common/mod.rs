//! Shared setup for endpoint manager and scheduler tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use vipd_locks::{DistributedLock, Lease, LeaseLock, LeaseLockConfig, LockStatus, OnChange, Watcher};
use vipd_manager::{ManagerConfig, Scheduler, State, Storage};
use vipd_model::{Endpoint, KeyLayout};
use vipd_plugin::Registry;
use vipd_plugin_mock::{MockFactory, NAME};
use vipd_store_memory::MemoryStore;

pub const KEEPALIVE: Duration = Duration::from_secs(1);

pub fn config(hostname: &str) -> ManagerConfig {
    ManagerConfig {
        hostname: hostname.to_string(),
        keepalive_interval: KEEPALIVE,
        healthcheck_interval: Duration::from_millis(500),
        healthcheck_timeout: Duration::from_millis(200),
        ensure_interval: Duration::from_secs(2),
        store_timeout: Duration::from_secs(1),
        hook_timeout: Duration::from_secs(3),
    }
}

pub fn endpoint(id: &str, key: &str) -> Endpoint {
    let mut endpoint = Endpoint::new(NAME, json!({ "key": key }));
    endpoint.id = id.to_string();
    endpoint
}

/// Lease lock that counts calls and remembers the last lease it handed out.
#[derive(Clone, Debug)]
pub struct CountingLock {
    inner: LeaseLock<MemoryStore>,
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    last_lease: Arc<Mutex<Option<Lease>>>,
}

impl CountingLock {
    pub fn new(store: &MemoryStore, hostname: &str) -> Self {
        let inner = LeaseLock::new(
            store.clone(),
            LeaseLockConfig {
                layout: KeyLayout::default(),
                holder: hostname.to_string(),
                operation_timeout: Duration::from_secs(1),
            },
        );

        Self {
            inner,
            acquired: Arc::default(),
            released: Arc::default(),
            last_lease: Arc::default(),
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn last_lease(&self) -> Option<Lease> {
        *self.last_lease.lock().unwrap()
    }
}

#[async_trait]
impl DistributedLock for CountingLock {
    type Error = vipd_locks::Error;

    async fn check(&self, key: &str) -> Result<LockStatus, Self::Error> {
        self.inner.check(key).await
    }

    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, Self::Error> {
        let lease = self.inner.acquire(key, ttl).await?;
        if lease.is_some() {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            *self.last_lease.lock().unwrap() = lease;
        }
        Ok(lease)
    }

    async fn renew(&self, lease: Lease, cancel: CancellationToken) -> Self::Error {
        self.inner.renew(lease, cancel).await
    }

    async fn release(&self, key: &str, lease: Lease) -> Result<(), Self::Error> {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.inner.release(key, lease).await
    }

    fn watch(&self, key: &str, on_change: OnChange) -> Watcher {
        self.inner.watch(key, on_change)
    }
}

/// One simulated host: its scheduler, lock and mock plugin recorder.
pub struct TestHost {
    pub mocks: Arc<MockFactory>,
    pub lock: CountingLock,
    pub scheduler: Scheduler<MemoryStore, CountingLock>,
}

pub fn host(store: &MemoryStore, hostname: &str) -> TestHost {
    let mocks = Arc::new(MockFactory::new());
    let lock = CountingLock::new(store, hostname);
    let storage = Storage::new(
        store.clone(),
        KeyLayout::default(),
        hostname,
        Duration::from_secs(1),
    );
    let registry = Registry::new(NAME).with(mocks.clone());

    TestHost {
        mocks,
        lock: lock.clone(),
        scheduler: Scheduler::new(storage, lock, registry, config(hostname)),
    }
}

impl TestHost {
    pub async fn state(&self, id: &str) -> State {
        self.scheduler.endpoint_status(id).await.unwrap().state
    }

    /// Polls until the endpoint reaches `state`.
    pub async fn wait_for(&self, id: &str, state: State) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while self.state(id).await != state {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("endpoint {id} never reached {state}"));
    }
}

/// Polls `condition` until it holds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// A local port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
