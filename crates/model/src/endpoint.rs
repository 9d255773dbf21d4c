use crate::Error;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single health probe run against the local host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum HealthCheck {
    /// Succeeds when a TCP connection to `host:port` can be opened.
    Tcp {
        /// Host name or address to connect to.
        host: String,

        /// Port to connect to.
        port: u16,
    },
}

impl fmt::Display for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

/// An externally visible resource kept active on exactly one host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Identity of the endpoint, unique per host.
    pub id: String,

    /// Name of the activation strategy. Empty means the registry default.
    #[serde(default)]
    pub plugin: String,

    /// Opaque configuration handed to the activation strategy.
    #[serde(default)]
    pub plugin_config: serde_json::Value,

    /// Health probes that must all pass for this host to hold the endpoint.
    #[serde(default)]
    pub checks: Vec<HealthCheck>,

    /// Per-endpoint health check interval, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck_interval_ms: Option<u64>,
}

impl Endpoint {
    /// Creates an endpoint with a generated identity.
    #[must_use]
    pub fn new(plugin: impl Into<String>, plugin_config: serde_json::Value) -> Self {
        Self {
            id: Self::generate_id(),
            plugin: plugin.into(),
            plugin_config,
            checks: Vec::new(),
            healthcheck_interval_ms: None,
        }
    }

    /// Generates a fresh endpoint identity.
    #[must_use]
    pub fn generate_id() -> String {
        format!("vip-{}", Uuid::new_v4().as_hyphenated())
    }

    /// Sets the health probes.
    #[must_use]
    pub fn with_checks(mut self, checks: Vec<HealthCheck>) -> Self {
        self.checks = checks;
        self
    }

    /// The per-endpoint health check interval, if one was configured.
    #[must_use]
    pub fn healthcheck_interval(&self) -> Option<Duration> {
        self.healthcheck_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Encodes the endpoint for storage.
    ///
    /// # Errors
    /// Returns an error if the plugin configuration cannot be serialized.
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|source| Error::Json {
                record: "endpoint",
                source,
            })
    }

    /// Decodes a stored endpoint.
    ///
    /// # Errors
    /// Returns an error if the bytes are not a valid endpoint record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|source| Error::Json {
            record: "endpoint",
            source,
        })
    }
}
