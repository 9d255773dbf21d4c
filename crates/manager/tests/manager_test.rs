mod common;

use common::{CountingLock, KEEPALIVE, config, endpoint, eventually};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing_test::traced_test;
use vipd_locks::{DistributedLock, LockStatus};
use vipd_manager::{EndpointManager, State};
use vipd_model::HealthCheck;
use vipd_plugin::{Plugin, PluginFactory};
use vipd_plugin_mock::MockFactory;
use vipd_store_memory::MemoryStore;

async fn start_manager(
    store: &MemoryStore,
    hostname: &str,
    mocks: &MockFactory,
    id: &str,
) -> (EndpointManager, CountingLock) {
    let lock = CountingLock::new(store, hostname);
    let endpoint = endpoint(id, "10.0.0.10");
    let plugin = mocks.create(&endpoint).await.unwrap();

    let manager = EndpointManager::start(endpoint, "mock", plugin, lock.clone(), config(hostname));
    (manager, lock)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Fault {
    PanicOnEnsure,
    HangOnDisable,
}

/// Plugin that misbehaves in one hook and counts deactivations.
struct Faulty {
    fault: Fault,
    disables: AtomicUsize,
}

impl Faulty {
    fn new(fault: Fault) -> Arc<Self> {
        Arc::new(Self {
            fault,
            disables: AtomicUsize::new(0),
        })
    }

    fn disables(&self) -> usize {
        self.disables.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Plugin for Faulty {
    async fn activate(&self) -> Result<(), vipd_plugin::Error> {
        Ok(())
    }

    async fn disable(&self) -> Result<(), vipd_plugin::Error> {
        self.disables.fetch_add(1, Ordering::SeqCst);
        if self.fault == Fault::HangOnDisable {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn ensure(&self) -> Result<(), vipd_plugin::Error> {
        assert_ne!(self.fault, Fault::PanicOnEnsure, "ensure blew up");
        Ok(())
    }

    fn election_key(&self) -> String {
        "10.0.0.10".to_string()
    }
}

async fn wait_for(states: &mut watch::Receiver<State>, state: State) {
    tokio::time::timeout(Duration::from_secs(60), states.wait_for(|current| *current == state))
        .await
        .unwrap_or_else(|_| panic!("never reached {state}"))
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_activates_then_stop_deactivates_once() {
    let store = MemoryStore::new();
    let mocks = MockFactory::new();
    let (manager, lock) = start_manager(&store, "host-a", &mocks, "e1").await;

    wait_for(&mut manager.subscribe(), State::Activated).await;
    let state = mocks.state("e1");
    assert_eq!(state.activations(), 1);
    assert!(state.is_active());
    assert_eq!(lock.check("10.0.0.10").await.unwrap(), LockStatus::HeldBySelf);

    manager.stop().await;
    manager.stop().await;

    assert_eq!(manager.state(), State::Standby);
    assert_eq!(state.disables(), 1);
    assert_eq!(lock.released(), 1);
    assert_eq!(lock.check("10.0.0.10").await.unwrap(), LockStatus::Free);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_standby_does_not_disable() {
    let store = MemoryStore::new();
    let mocks = MockFactory::new();

    let (owner, _) = start_manager(&store, "host-a", &mocks, "e1").await;
    wait_for(&mut owner.subscribe(), State::Activated).await;

    let other_mocks = MockFactory::new();
    let (standby, lock) = start_manager(&store, "host-b", &other_mocks, "e1").await;
    tokio::time::sleep(KEEPALIVE * 5).await;

    assert_eq!(standby.state(), State::Standby);
    standby.stop().await;

    assert_eq!(other_mocks.state("e1").disables(), 0);
    assert_eq!(lock.released(), 0);
    assert_eq!(owner.state(), State::Activated);

    owner.stop().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_lost_lease_demotes_and_reelects() {
    let store = MemoryStore::new();
    let mocks = MockFactory::new();
    let (manager, lock) = start_manager(&store, "host-a", &mocks, "e1").await;
    let mut states = manager.subscribe();

    wait_for(&mut states, State::Activated).await;
    let first = lock.last_lease().unwrap();
    store.expire_lease(first.id).await;

    wait_for(&mut states, State::Standby).await;
    assert_eq!(mocks.state("e1").disables(), 1);
    assert!(logs_contain("ownership lost"));

    wait_for(&mut states, State::Activated).await;
    assert_eq!(mocks.state("e1").activations(), 2);
    assert_ne!(lock.last_lease().unwrap().id, first.id);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_while_active_steps_down() {
    let store = MemoryStore::new();
    let mocks = MockFactory::new();
    let (manager, _lock) = start_manager(&store, "host-a", &mocks, "e1").await;
    let mut states = manager.subscribe();

    wait_for(&mut states, State::Activated).await;
    store.set_unavailable(true).await;

    wait_for(&mut states, State::Standby).await;
    assert_eq!(mocks.state("e1").disables(), 1);

    store.set_unavailable(false).await;
    wait_for(&mut states, State::Activated).await;

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_health_failure_steps_down() {
    let store = MemoryStore::new();
    let mocks = MockFactory::new();
    let (manager, lock) = start_manager(&store, "host-a", &mocks, "e1").await;
    let mut states = manager.subscribe();

    wait_for(&mut states, State::Activated).await;

    let failing = manager.endpoint().with_checks(vec![HealthCheck::Tcp {
        host: "127.0.0.1".to_string(),
        port: common::closed_port(),
    }]);
    manager.update_endpoint(failing);

    wait_for(&mut states, State::Standby).await;
    assert!(logs_contain("endpoint unhealthy, stepping down"));
    assert_eq!(mocks.state("e1").disables(), 1);
    assert_eq!(manager.status().healthy, Some(false));

    // Stays down while unhealthy.
    tokio::time::sleep(KEEPALIVE * 5).await;
    assert_eq!(manager.state(), State::Standby);
    assert_eq!(lock.acquired(), 1);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconfigured_checks_keep_ownership() {
    let store = MemoryStore::new();
    let mocks = MockFactory::new();
    let (manager, _lock) = start_manager(&store, "host-a", &mocks, "e1").await;
    let mut states = manager.subscribe();

    wait_for(&mut states, State::Activated).await;

    let mut updated = manager.endpoint();
    updated.healthcheck_interval_ms = Some(250);
    manager.update_endpoint(updated.clone());

    tokio::time::sleep(KEEPALIVE * 3).await;
    assert_eq!(manager.state(), State::Activated);
    assert_eq!(manager.endpoint(), updated);
    assert_eq!(mocks.state("e1").disables(), 0);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_ensure_failure_reasserts_activation() {
    let store = MemoryStore::new();
    let mocks = MockFactory::new();
    let (manager, _lock) = start_manager(&store, "host-a", &mocks, "e1").await;

    wait_for(&mut manager.subscribe(), State::Activated).await;
    let state = mocks.state("e1");

    state.set_fail_ensure(true);
    eventually("reactivation", || state.activations() >= 2).await;

    assert_eq!(manager.state(), State::Activated);
    assert_eq!(state.disables(), 0);
    assert!(state.ensures() >= 1);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_activation_is_retried() {
    let store = MemoryStore::new();
    let mocks = MockFactory::new();
    let state = mocks.state("e1");
    state.set_fail_activate(true);

    let (manager, _lock) = start_manager(&store, "host-a", &mocks, "e1").await;
    wait_for(&mut manager.subscribe(), State::Activated).await;
    assert!(!state.is_active());

    state.set_fail_activate(false);
    eventually("recovered activation", || state.is_active()).await;
    assert_eq!(manager.state(), State::Activated);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failover_hands_over_to_peer() {
    let store = MemoryStore::new();
    let mocks_a = MockFactory::new();
    let mocks_b = MockFactory::new();

    let (a, _) = start_manager(&store, "host-a", &mocks_a, "e1").await;
    wait_for(&mut a.subscribe(), State::Activated).await;

    let (b, _) = start_manager(&store, "host-b", &mocks_b, "e1").await;
    tokio::time::sleep(KEEPALIVE * 3).await;
    assert_eq!(b.state(), State::Standby);

    a.failover().await.unwrap();
    assert_eq!(a.state(), State::Standby);
    assert_eq!(mocks_a.state("e1").disables(), 1);

    wait_for(&mut b.subscribe(), State::Activated).await;

    tokio::time::sleep(KEEPALIVE * 5).await;
    assert_eq!(a.state(), State::Standby);
    assert_eq!(b.state(), State::Activated);

    a.stop().await;
    b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failover_while_standby_is_noop() {
    let store = MemoryStore::new();
    store.set_unavailable(true).await;

    let mocks = MockFactory::new();
    let (manager, lock) = start_manager(&store, "host-a", &mocks, "e1").await;

    manager.failover().await.unwrap();
    assert_eq!(manager.state(), State::Standby);
    assert_eq!(mocks.state("e1").disables(), 0);
    assert_eq!(lock.released(), 0);

    manager.stop().await;
    assert_matches::assert_matches!(manager.failover().await, Err(vipd_manager::Error::Stopped));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_crashed_manager_gives_up_the_lock() {
    let store = MemoryStore::new();
    let lock = CountingLock::new(&store, "host-a");
    let plugin = Faulty::new(Fault::PanicOnEnsure);
    let manager = EndpointManager::start(
        endpoint("e1", "10.0.0.10"),
        "faulty",
        plugin.clone(),
        lock.clone(),
        config("host-a"),
    );

    wait_for(&mut manager.subscribe(), State::Activated).await;

    // The first reconciliation takes the control loop down with it.
    wait_for(&mut manager.subscribe(), State::Standby).await;
    eventually("lock released", || lock.released() == 1).await;
    assert_eq!(plugin.disables(), 1);
    assert_eq!(lock.check("10.0.0.10").await.unwrap(), LockStatus::Free);
    assert!(logs_contain("endpoint manager exited while owner"));

    let mocks = MockFactory::new();
    let (peer, _) = start_manager(&store, "host-b", &mocks, "e1").await;
    wait_for(&mut peer.subscribe(), State::Activated).await;

    tokio::time::sleep(KEEPALIVE * 5).await;
    assert_eq!(peer.state(), State::Activated);

    peer.stop().await;
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_bounded_when_deactivation_hangs() {
    let store = MemoryStore::new();
    let lock = CountingLock::new(&store, "host-a");
    let config = config("host-a");
    let plugin = Faulty::new(Fault::HangOnDisable);
    let manager = EndpointManager::start(
        endpoint("e1", "10.0.0.10"),
        "faulty",
        plugin.clone(),
        lock.clone(),
        config.clone(),
    );

    wait_for(&mut manager.subscribe(), State::Activated).await;

    let started = tokio::time::Instant::now();
    tokio::time::timeout(config.hook_timeout + config.store_timeout, manager.stop())
        .await
        .expect("stop hung on the deactivation hook");

    assert!(started.elapsed() >= config.hook_timeout);
    assert_eq!(plugin.disables(), 1);
    assert_eq!(manager.state(), State::Standby);
    assert_eq!(lock.released(), 1);
    assert_eq!(lock.check("10.0.0.10").await.unwrap(), LockStatus::Free);
}
