use thiserror::Error;

/// Errors that can occur when decoding stored records.
#[derive(Debug, Error)]
pub enum Error {
    /// The record could not be encoded or decoded.
    #[error("invalid {record} record: {source}")]
    Json {
        /// Which record was being processed.
        record: &'static str,

        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// A key did not live under the expected prefix.
    #[error("key {key} is not under {prefix}")]
    UnexpectedKey {
        /// The offending key.
        key: String,

        /// The prefix it should have had.
        prefix: String,
    },
}
