use thiserror::Error;
use vipd_store::StoreError;

/// Errors that can occur when talking to etcd.
#[derive(Debug, Error)]
pub enum Error {
    /// Initial connection to the cluster failed.
    #[error("failed to connect to etcd: {0}")]
    Connect(#[source] etcd_client::Error),

    /// Every attempt of an operation timed out.
    #[error("etcd operation {operation} timed out after {attempts} attempts")]
    Timeout {
        /// Name of the operation.
        operation: &'static str,
        /// Number of attempts made before giving up.
        attempts: usize,
    },

    /// An operation failed with an etcd error.
    #[error("etcd operation {operation} failed after {attempts} attempts: {source}")]
    Etcd {
        /// Name of the operation.
        operation: &'static str,
        /// Number of attempts made before giving up.
        attempts: usize,
        /// The last error received.
        #[source]
        source: etcd_client::Error,
    },

    /// The server closed the keep-alive stream.
    #[error("lease keep-alive stream closed")]
    KeepAliveClosed,

    /// The server canceled the watch.
    #[error("watch canceled by server: {0}")]
    WatchCanceled(String),

    /// The watch stream failed.
    #[error("watch stream failed: {0}")]
    Watch(#[source] etcd_client::Error),
}

impl StoreError for Error {
    fn is_retriable(&self) -> bool {
        match self {
            Self::Connect(_)
            | Self::Timeout { .. }
            | Self::KeepAliveClosed
            | Self::WatchCanceled(_) => true,
            Self::Etcd { source, .. } | Self::Watch(source) => {
                is_retriable_etcd_error(&source.to_string())
            }
        }
    }
}

/// Transport trouble and leader changes are worth retrying; anything else
/// (bad request, auth, missing lease) is not.
pub(crate) fn is_retriable_etcd_error(error_str: &str) -> bool {
    let error_str = error_str.to_ascii_lowercase();

    error_str.contains("timeout")
        || error_str.contains("timed out")
        || error_str.contains("connection")
        || error_str.contains("unavailable")
        || error_str.contains("transport")
        || error_str.contains("leader changed")
        || error_str.contains("no leader")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(is_retriable_etcd_error("grpc request error: status: Unavailable"));
        assert!(is_retriable_etcd_error("etcdserver: leader changed"));
        assert!(is_retriable_etcd_error("transport error"));
        assert!(!is_retriable_etcd_error("etcdserver: requested lease not found"));
        assert!(!is_retriable_etcd_error("etcdserver: permission denied"));
    }

    #[test]
    fn test_timeouts_are_retriable() {
        let error = Error::Timeout {
            operation: "get",
            attempts: 3,
        };
        assert!(error.is_retriable());
    }
}
