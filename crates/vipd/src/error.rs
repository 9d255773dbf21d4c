use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Could not reach the coordination store at startup.
    #[error(transparent)]
    Etcd(#[from] vipd_store_etcd::Error),

    /// IO operation failed.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),

    #[error("failed to install log subscriber: {0}")]
    Logging(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Manager(#[from] vipd_manager::Error),

    #[error("no hostname: set --hostname, VIPD_HOSTNAME or HOSTNAME")]
    MissingHostname,
}
