//! Local health probes for an endpoint.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::fmt;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use vipd_model::HealthCheck;

/// A probe that did not pass, and why.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeFailure {
    /// The probe that failed.
    pub check: HealthCheck,

    /// Human readable reason.
    pub reason: String,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.check, self.reason)
    }
}

/// Outcome of one round of probes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthReport {
    /// Every probe passed.
    pub healthy: bool,

    /// The probes that did not.
    pub failures: Vec<ProbeFailure>,
}

impl HealthReport {
    /// A report with nothing wrong in it.
    #[must_use]
    pub const fn healthy() -> Self {
        Self {
            healthy: true,
            failures: Vec::new(),
        }
    }
}

/// Runs a fixed set of probes concurrently, each bounded by `timeout`.
#[derive(Clone, Debug)]
pub struct HealthChecker {
    checks: Vec<HealthCheck>,
    timeout: Duration,
}

impl HealthChecker {
    /// Creates a checker for `checks`.
    #[must_use]
    pub const fn new(checks: Vec<HealthCheck>, timeout: Duration) -> Self {
        Self { checks, timeout }
    }

    /// The probes this checker runs.
    #[must_use]
    pub fn checks(&self) -> &[HealthCheck] {
        &self.checks
    }

    /// Runs every probe once. A checker without probes is always healthy.
    pub async fn check(&self) -> HealthReport {
        let probes = self.checks.iter().map(|check| async move {
            self.probe(check).await.err().map(|reason| ProbeFailure {
                check: check.clone(),
                reason,
            })
        });

        let failures: Vec<ProbeFailure> = futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .collect();

        if !failures.is_empty() {
            debug!(failed = failures.len(), total = self.checks.len(), "health probes failed");
        }

        HealthReport {
            healthy: failures.is_empty(),
            failures,
        }
    }

    async fn probe(&self, check: &HealthCheck) -> Result<(), String> {
        match check {
            HealthCheck::Tcp { host, port } => {
                match timeout(self.timeout, TcpStream::connect((host.as_str(), *port))).await {
                    Ok(Ok(_stream)) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {:?}", self.timeout)),
                }
            }
        }
    }
}
