use crate::Error;

use std::time::Duration;

/// Timing and identity shared by every endpoint manager on this host.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// This host's identity, written as lock holder and used in keys.
    pub hostname: String,

    /// How often leases are kept alive and elections retried. Leases are
    /// granted for twice this.
    pub keepalive_interval: Duration,

    /// Default interval between health check rounds.
    pub healthcheck_interval: Duration,

    /// Bound on a single health probe.
    pub healthcheck_timeout: Duration,

    /// Interval between reconciliations while active.
    pub ensure_interval: Duration,

    /// Bound on individual coordination store calls.
    pub store_timeout: Duration,

    /// Bound on a single plugin hook. A hook that overruns counts as failed.
    pub hook_timeout: Duration,
}

impl ManagerConfig {
    /// TTL of every lease this host grants.
    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        self.keepalive_interval * 2
    }

    /// Rejects settings the managers cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the hostname is empty or any
    /// interval or timeout is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.hostname.is_empty() {
            return Err(Error::InvalidConfig("hostname is empty".to_string()));
        }

        let durations = [
            ("keepalive_interval", self.keepalive_interval),
            ("healthcheck_interval", self.healthcheck_interval),
            ("healthcheck_timeout", self.healthcheck_timeout),
            ("ensure_interval", self.ensure_interval),
            ("store_timeout", self.store_timeout),
            ("hook_timeout", self.hook_timeout),
        ];

        match durations.iter().find(|(_, duration)| duration.is_zero()) {
            Some((name, _)) => Err(Error::InvalidConfig(format!("{name} must be positive"))),
            None => Ok(()),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            keepalive_interval: Duration::from_secs(3),
            healthcheck_interval: Duration::from_secs(5),
            healthcheck_timeout: Duration::from_secs(2),
            ensure_interval: Duration::from_secs(10),
            store_timeout: Duration::from_secs(5),
            hook_timeout: Duration::from_secs(30),
        }
    }
}
