use crate::fsm::{Event, State};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur managing endpoints.
#[derive(Debug, Error)]
pub enum Error {
    /// Another local endpoint already competes under this election key.
    #[error("election key {election_key} is already used by endpoint {endpoint_id}")]
    Conflict {
        /// The contested key.
        election_key: String,
        /// The endpoint holding it.
        endpoint_id: String,
    },

    /// An endpoint with this identity already exists.
    #[error("endpoint {0} already exists")]
    AlreadyExists(String),

    /// No endpoint with this identity is registered.
    #[error("endpoint {0} not found")]
    NotFound(String),

    /// No plugin factory is registered under this name.
    #[error("plugin {0} not found")]
    PluginNotFound(String),

    /// The coordination store failed a call.
    #[error("coordination store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A coordination store call did not complete in time.
    #[error("store call {operation} timed out after {timeout:?}")]
    StoreTimeout {
        /// Name of the call.
        operation: &'static str,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// A plugin hook or factory failed.
    #[error(transparent)]
    Plugin(vipd_plugin::Error),

    /// The distributed lock failed.
    #[error("lock error: {0}")]
    Lock(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The event is not valid in the current state.
    #[error("invalid transition: {event} in state {state}")]
    InvalidTransition {
        /// State the machine was in.
        state: State,
        /// Rejected event.
        event: Event,
    },

    /// A stored record could not be encoded or decoded.
    #[error(transparent)]
    Serde(#[from] vipd_model::Error),

    /// The manager configuration cannot be run with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The endpoint manager is no longer running.
    #[error("endpoint manager stopped")]
    Stopped,
}

impl Error {
    /// Whether the error refers to something that does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::PluginNotFound(_))
    }

    /// Whether the error is a registration conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists(_))
    }
}

impl From<vipd_plugin::Error> for Error {
    fn from(error: vipd_plugin::Error) -> Self {
        match error {
            vipd_plugin::Error::NotFound(name) => Self::PluginNotFound(name),
            other => Self::Plugin(other),
        }
    }
}

/// Error payload of the administrative API. Older clients send the message
/// under `msg`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human readable message.
    #[serde(alias = "msg")]
    pub error: String,
}

impl From<&Error> for ErrorBody {
    fn from(error: &Error) -> Self {
        Self {
            error: error.to_string(),
        }
    }
}
