use thiserror::Error;

/// Errors produced by plugins and the registry.
#[derive(Debug, Error)]
pub enum Error {
    /// No factory is registered under this name.
    #[error("plugin {0} not found")]
    NotFound(String),

    /// The endpoint's plugin configuration was rejected.
    #[error("invalid {plugin} configuration: {reason}")]
    InvalidConfig {
        /// The plugin that rejected it.
        plugin: String,
        /// Why.
        reason: String,
    },

    /// A hook failed.
    #[error("{operation} failed: {source}")]
    Failed {
        /// The hook that failed.
        operation: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    /// Wraps a hook failure.
    pub fn failed<E>(operation: &'static str, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Failed {
            operation,
            source: source.into(),
        }
    }
}
