use thiserror::Error;
use vipd_store::{LeaseId, StoreError};

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The store was made unavailable with `set_unavailable`.
    #[error("store unavailable")]
    Unavailable,

    /// The lease does not exist or already expired.
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    /// The watch was broken with `break_watches`.
    #[error("watch stream broken")]
    WatchBroken,

    /// The watcher fell too far behind and missed events.
    #[error("watcher lagged behind by {0} batches")]
    WatchLagged(u64),
}

impl StoreError for Error {
    fn is_retriable(&self) -> bool {
        !matches!(self, Self::LeaseNotFound(_))
    }
}
