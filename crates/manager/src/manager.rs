//! One endpoint's lifecycle: election, health, lease renewal and
//! reconciliation, all funnelled through a single control loop.

use crate::fsm::{Event, State, StateMachine, Transition};
use crate::{Error, ManagerConfig};

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use vipd_health::{HealthChecker, HealthReport};
use vipd_locks::{DistributedLock, Lease, LockStatus, OnChange};
use vipd_model::Endpoint;
use vipd_plugin::Plugin;

const COMMAND_CAPACITY: usize = 32;

/// Infrastructure failures stretch the election interval up to this many
/// keep-alive intervals.
const MAX_BACKOFF_FACTOR: u32 = 4;

/// Point-in-time view of one endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    /// Endpoint identity.
    pub id: String,

    /// Key the endpoint competes under.
    pub election_key: String,

    /// Resolved activation strategy name.
    pub plugin: String,

    /// Local role.
    pub state: State,

    /// Outcome of the last health round, `None` before the first.
    pub healthy: Option<bool>,

    /// Probes that failed in the last round.
    pub failures: Vec<String>,
}

enum Command {
    Health(HealthReport),
    LockChanged,
    RenewalEnded { generation: u64, reason: String },
    HealthTaskExited(String),
    Failover(oneshot::Sender<()>),
}

/// Handle to a running endpoint manager.
pub struct EndpointManager {
    id: String,
    election_key: String,
    plugin_name: String,
    fsm: Arc<StateMachine>,
    endpoint: watch::Sender<Endpoint>,
    health: watch::Receiver<Option<HealthReport>>,
    commands: mpsc::Sender<Command>,
    shutdown_token: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EndpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointManager")
            .field("id", &self.id)
            .field("election_key", &self.election_key)
            .field("state", &self.fsm.state())
            .finish_non_exhaustive()
    }
}

impl EndpointManager {
    /// Starts managing `endpoint` in the background.
    pub fn start<L>(
        endpoint: Endpoint,
        plugin_name: impl Into<String>,
        plugin: Arc<dyn Plugin>,
        lock: L,
        config: ManagerConfig,
    ) -> Self
    where
        L: DistributedLock,
    {
        let id = endpoint.id.clone();
        let election_key = plugin.election_key();
        let fsm = Arc::new(StateMachine::new(plugin.clone(), config.hook_timeout));

        let (endpoint_tx, endpoint_rx) = watch::channel(endpoint);
        let (health_tx, health_rx) = watch::channel(None);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let shutdown_token = CancellationToken::new();

        let worker = Worker {
            election_key: election_key.clone(),
            next_election: Instant::now() + config.keepalive_interval,
            config,
            lock,
            plugin,
            fsm: fsm.clone(),
            endpoint: endpoint_rx,
            health: health_tx,
            commands_tx: commands_tx.clone(),
            commands: commands_rx,
            shutdown_token: shutdown_token.clone(),
            lease: None,
            renewal: None,
            generation: 0,
            healthy: false,
            degraded: false,
            infra_failures: 0,
            suppressed_until: None,
        };

        let span = info_span!("endpoint", endpoint_id = %id, election_key = %election_key);
        let task = tokio::spawn(worker.run().instrument(span));

        Self {
            id,
            election_key,
            plugin_name: plugin_name.into(),
            fsm,
            endpoint: endpoint_tx,
            health: health_rx,
            commands: commands_tx,
            shutdown_token,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    /// Endpoint identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Key this endpoint competes under.
    pub fn election_key(&self) -> &str {
        &self.election_key
    }

    /// Resolved activation strategy name.
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Current local role.
    pub fn state(&self) -> State {
        self.fsm.state()
    }

    /// Observes role changes.
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.fsm.subscribe()
    }

    /// The configuration the manager is running with.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.borrow().clone()
    }

    /// Snapshot of role and health.
    pub fn status(&self) -> EndpointStatus {
        let health = self.health.borrow();

        EndpointStatus {
            id: self.id.clone(),
            election_key: self.election_key.clone(),
            plugin: self.plugin_name.clone(),
            state: self.fsm.state(),
            healthy: health.as_ref().map(|report| report.healthy),
            failures: health
                .as_ref()
                .map(|report| report.failures.iter().map(ToString::to_string).collect())
                .unwrap_or_default(),
        }
    }

    /// Swaps in new configuration. Only the health checks and their interval
    /// take effect; ownership is kept.
    pub fn update_endpoint(&self, endpoint: Endpoint) {
        self.endpoint.send_replace(endpoint);
    }

    /// Gives up ownership now so another host can take over. This host will
    /// not compete again for one lease TTL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] if the manager is no longer running.
    pub async fn failover(&self) -> Result<(), Error> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Failover(reply))
            .await
            .map_err(|_| Error::Stopped)?;

        done.await.map_err(|_| Error::Stopped)
    }

    /// Stops the manager: deactivates if active and releases the lock.
    /// Later calls return immediately.
    pub async fn stop(&self) {
        self.shutdown_token.cancel();

        if let Some(task) = self.task.lock().await.take()
            && let Err(e) = task.await
        {
            error!(endpoint_id = %self.id, error = %e, "endpoint manager task failed");
        }
    }
}

impl Drop for EndpointManager {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

struct Renewal {
    generation: u64,
    cancel: CancellationToken,
}

struct Worker<L: DistributedLock> {
    election_key: String,
    config: ManagerConfig,
    lock: L,
    plugin: Arc<dyn Plugin>,
    fsm: Arc<StateMachine>,
    endpoint: watch::Receiver<Endpoint>,
    health: watch::Sender<Option<HealthReport>>,
    commands_tx: mpsc::Sender<Command>,
    commands: mpsc::Receiver<Command>,
    shutdown_token: CancellationToken,
    lease: Option<Lease>,
    renewal: Option<Renewal>,
    generation: u64,
    healthy: bool,
    degraded: bool,
    infra_failures: u32,
    next_election: Instant,
    suppressed_until: Option<Instant>,
}

impl<L: DistributedLock> Worker<L> {
    async fn run(mut self) {
        info!("endpoint manager started");

        let watcher = self.lock.watch(&self.election_key, self.on_lock_change());
        self.spawn_health_task();

        let mut ensure = tokio::time::interval_at(
            Instant::now() + self.config.ensure_interval,
            self.config.ensure_interval,
        );
        ensure.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.shutdown_token.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle(command).await,
                () = tokio::time::sleep_until(self.next_election) => self.elect().await,
                _ = ensure.tick() => self.reconcile().await,
            }
        }

        watcher.stop().await;
        self.cleanup().await;

        info!("endpoint manager stopped");
    }

    fn on_lock_change(&self) -> OnChange {
        let commands = self.commands_tx.clone();

        Arc::new(move || {
            // Dropped when the queue is full: a wake-up is already pending.
            let _ = commands.try_send(Command::LockChanged);
            async {}.boxed()
        })
    }

    fn spawn_health_task(&self) {
        let task = tokio::spawn(
            health_loop(
                self.endpoint.clone(),
                self.config.clone(),
                self.commands_tx.clone(),
                self.shutdown_token.clone(),
            )
            .instrument(Span::current()),
        );

        let commands = self.commands_tx.clone();
        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            let reason = match task.await {
                Ok(()) => "health task returned".to_string(),
                Err(e) => e.to_string(),
            };

            if !shutdown_token.is_cancelled() {
                let _ = commands.send(Command::HealthTaskExited(reason)).await;
            }
        });
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Health(report) => self.on_health(report).await,
            Command::LockChanged => {
                debug!("lock key changed");
                if self.can_elect() {
                    self.elect().await;
                }
            }
            Command::RenewalEnded { generation, reason } => {
                self.on_renewal_ended(generation, &reason).await;
            }
            Command::HealthTaskExited(reason) => {
                error!(%reason, "health task exited, restarting it");
                self.healthy = false;
                self.step_down().await;
                self.spawn_health_task();
            }
            Command::Failover(reply) => {
                self.failover().await;
                let _ = reply.send(());
            }
        }
    }

    const fn is_owner(&self) -> bool {
        self.lease.is_some()
    }

    fn can_elect(&mut self) -> bool {
        if let Some(until) = self.suppressed_until {
            if Instant::now() < until {
                return false;
            }
            self.suppressed_until = None;
        }

        self.healthy && !self.is_owner() && self.fsm.state() == State::Standby
    }

    fn election_delay(&self) -> Duration {
        let factor = 1u32
            .checked_shl(self.infra_failures)
            .unwrap_or(MAX_BACKOFF_FACTOR)
            .min(MAX_BACKOFF_FACTOR);

        self.config.keepalive_interval * factor
    }

    fn infra_failed(&mut self, error: &dyn std::fmt::Display) {
        self.infra_failures = self.infra_failures.saturating_add(1);
        let retry_in = self.election_delay();
        self.next_election = Instant::now() + retry_in;

        warn!(%error, attempt = self.infra_failures, ?retry_in, "election attempt failed");
    }

    async fn elect(&mut self) {
        self.next_election = Instant::now() + self.election_delay();

        if !self.can_elect() {
            return;
        }

        match self.lock.check(&self.election_key).await {
            Ok(LockStatus::HeldByOther(holder)) => {
                self.infra_failures = 0;
                debug!(%holder, "lock held by another host");
                return;
            }
            Ok(LockStatus::Free | LockStatus::HeldBySelf) => {}
            Err(e) => {
                self.infra_failed(&e);
                return;
            }
        }

        match self
            .lock
            .acquire(&self.election_key, self.config.lease_ttl())
            .await
        {
            Ok(Some(lease)) => {
                self.infra_failures = 0;
                self.on_elected(lease).await;
            }
            Ok(None) => {
                self.infra_failures = 0;
                debug!("lost election race");
            }
            Err(e) => self.infra_failed(&e),
        }
    }

    async fn on_elected(&mut self, lease: Lease) {
        self.lease = Some(lease);

        match self.fsm.fire(Event::Elected).await {
            Ok(transition) => {
                info!(lease_id = lease.id, "elected, endpoint activated");
                if let Err(e) = transition.hook {
                    error!(error = %e, "activation failed, retrying on next reconciliation");
                    self.degraded = true;
                }
                self.start_renewal(lease);
            }
            Err(e) => {
                error!(error = %e, "won the lock but could not activate");
                self.lease = None;
                self.release(lease).await;
            }
        }
    }

    /// Keeps `lease` alive in the background and reports back when renewal
    /// ends. If this loop is gone by then, or goes away first, the lease is
    /// given up from here.
    fn start_renewal(&mut self, lease: Lease) {
        self.generation += 1;
        let generation = self.generation;
        let cancel = self.shutdown_token.child_token();

        let mut task = tokio::spawn({
            let lock = self.lock.clone();
            let cancel = cancel.clone();
            async move { lock.renew(lease, cancel).await.to_string() }.instrument(Span::current())
        });

        let commands = self.commands_tx.clone();
        let renewal = cancel.clone();
        let lock = self.lock.clone();
        let fsm = self.fsm.clone();
        let election_key = self.election_key.clone();
        let store_timeout = self.config.store_timeout;
        tokio::spawn(
            async move {
                let ended = tokio::select! {
                    biased;
                    ended = &mut task => Some(ended),
                    () = commands.closed() => None,
                };

                // A cancelled renewal was stopped by the loop, which handles
                // the lease itself.
                match ended {
                    Some(ended) => {
                        let reason =
                            ended.unwrap_or_else(|e| format!("renewal task failed: {e}"));
                        let sent = commands
                            .send(Command::RenewalEnded { generation, reason })
                            .await;
                        if sent.is_ok() || renewal.is_cancelled() {
                            return;
                        }
                    }
                    None if renewal.is_cancelled() => return,
                    None => {
                        renewal.cancel();
                        let _ = task.await;
                    }
                }

                error!(lease_id = lease.id, "endpoint manager exited while owner, stepping down");
                if fsm.state() == State::Activated {
                    match fsm.fire(Event::Demoted).await {
                        Ok(Transition { hook: Err(e), .. }) => error!(error = %e, "deactivation failed"),
                        Ok(_) => info!("endpoint demoted"),
                        Err(e) => debug!(error = %e, "nothing to demote"),
                    }
                }
                release(&lock, &election_key, lease, store_timeout).await;
            }
            .instrument(Span::current()),
        );

        self.renewal = Some(Renewal { generation, cancel });
    }

    fn stop_renewal(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.cancel.cancel();
        }
    }

    async fn on_renewal_ended(&mut self, generation: u64, reason: &str) {
        if self
            .renewal
            .as_ref()
            .is_none_or(|renewal| renewal.generation != generation)
        {
            debug!(generation, "ignoring end of a stopped renewal");
            return;
        }
        self.renewal = None;

        warn!(%reason, "lease renewal ended, ownership lost");

        let lease = self.lease.take();
        self.demote().await;
        if let Some(lease) = lease {
            self.release(lease).await;
        }
    }

    async fn on_health(&mut self, report: HealthReport) {
        let was_healthy = self.healthy;
        self.healthy = report.healthy;

        if report.healthy {
            self.health.send_replace(Some(report));

            if !was_healthy {
                info!("endpoint healthy");
                if self.can_elect() {
                    self.elect().await;
                }
            }
        } else {
            for failure in &report.failures {
                warn!(%failure, "health probe failed");
            }
            self.health.send_replace(Some(report));

            if self.is_owner() {
                warn!("endpoint unhealthy, stepping down");
                self.step_down().await;
            }
        }
    }

    async fn reconcile(&mut self) {
        if self.fsm.state() != State::Activated {
            return;
        }

        if !self.degraded {
            let ensured = tokio::time::timeout(self.config.hook_timeout, self.plugin.ensure())
                .await
                .unwrap_or_else(|elapsed| Err(vipd_plugin::Error::failed("ensure", elapsed)));

            match ensured {
                Ok(()) => {
                    debug!("endpoint reconciled");
                    return;
                }
                Err(e) => warn!(error = %e, "reconciliation failed, reasserting"),
            }
        }

        match self.fsm.fire(Event::Fault).await {
            Ok(transition) => match transition.hook {
                Ok(()) => {
                    if self.degraded {
                        info!("activation recovered");
                    }
                    self.degraded = false;
                }
                Err(e) => {
                    error!(error = %e, "reactivation failed");
                    self.degraded = true;
                }
            },
            Err(e) => error!(error = %e, "could not reassert activation"),
        }
    }

    async fn failover(&mut self) {
        if !self.is_owner() && self.fsm.state() == State::Standby {
            debug!("failover requested while standby");
            return;
        }

        info!("failover requested, stepping down");
        self.step_down().await;
        self.suppressed_until = Some(Instant::now() + self.config.lease_ttl());
    }

    async fn step_down(&mut self) {
        self.stop_renewal();

        if self.fsm.state() == State::Activated {
            self.demote().await;
        }

        if let Some(lease) = self.lease.take() {
            self.release(lease).await;
        }
    }

    async fn demote(&mut self) {
        match self.fsm.fire(Event::Demoted).await {
            Ok(transition) => {
                info!("endpoint demoted");
                if let Err(e) = transition.hook {
                    error!(error = %e, "deactivation failed");
                }
            }
            Err(e) => debug!(error = %e, "nothing to demote"),
        }

        self.degraded = false;
    }

    async fn release(&self, lease: Lease) {
        release(&self.lock, &self.election_key, lease, self.config.store_timeout).await;
    }

    async fn cleanup(&mut self) {
        self.stop_renewal();

        if self.fsm.state() == State::Activated {
            self.demote().await;
        }

        if let Some(lease) = self.lease.take() {
            self.release(lease).await;
        }
    }
}

/// Best-effort release bounded by `timeout`; the lease TTL reclaims the lock
/// if this fails.
async fn release<L>(lock: &L, election_key: &str, lease: Lease, timeout: Duration)
where
    L: DistributedLock,
{
    match tokio::time::timeout(timeout, lock.release(election_key, lease)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(lease_id = lease.id, error = %e, "failed to release lock, leaving it to expire"),
        Err(_) => warn!(lease_id = lease.id, "timed out releasing lock, leaving it to expire"),
    }
}

async fn health_loop(
    mut endpoint: watch::Receiver<Endpoint>,
    config: ManagerConfig,
    commands: mpsc::Sender<Command>,
    shutdown_token: CancellationToken,
) {
    loop {
        let (checker, period) = {
            let endpoint = endpoint.borrow_and_update();
            (
                HealthChecker::new(endpoint.checks.clone(), config.healthcheck_timeout),
                endpoint
                    .healthcheck_interval()
                    .unwrap_or(config.healthcheck_interval),
            )
        };

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown_token.cancelled() => return,
                changed = endpoint.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    debug!(checks = endpoint.borrow().checks.len(), "health checks reconfigured");
                    break;
                }
                _ = ticker.tick() => {
                    let report = tokio::select! {
                        () = shutdown_token.cancelled() => return,
                        report = checker.check() => report,
                    };

                    if commands.send(Command::Health(report)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
