use std::time::Duration;

use thiserror::Error;
use vipd_store::LeaseId;

use crate::LockError;

/// Errors that can occur when using the lease lock.
#[derive(Debug, Error)]
pub enum Error {
    /// The coordination store rejected or failed the call.
    #[error("coordination store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A store call did not complete in time.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Name of the store call.
        operation: &'static str,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// Leases must live long enough to be renewed at least once.
    #[error("lease TTL {0:?} is too short")]
    InvalidTtl(Duration),

    /// The store reported the lease as gone.
    #[error("lease {0} expired")]
    LeaseExpired(LeaseId),

    /// Renewal was cancelled by its owner.
    #[error("renewal cancelled")]
    Cancelled,
}

impl LockError for Error {}
