use thiserror::Error;

/// Errors that can occur when calling through a serializer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The serializer was stopped; no new calls are accepted.
    #[error("serializer stopped")]
    Stopped,

    /// The worker exited without answering.
    #[error("serializer worker exited before responding")]
    WorkerGone,
}
