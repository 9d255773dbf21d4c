use crate::Error;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Current format version of the records written by this release.
pub const DATA_VERSION: u32 = 1;

/// The record describing this process in the coordination store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Stable identity of the host.
    pub hostname: String,

    /// Lease currently bound to the host, `0` when none.
    pub lease_id: i64,

    /// Format version the record was written with.
    #[serde(default)]
    pub data_version: u32,
}

impl Host {
    /// Creates a host record at the current data version.
    #[must_use]
    pub fn new(hostname: impl Into<String>, lease_id: i64) -> Self {
        Self {
            hostname: hostname.into(),
            lease_id,
            data_version: DATA_VERSION,
        }
    }

    /// Whether the record was written by an older release.
    #[must_use]
    pub const fn needs_migration(&self) -> bool {
        self.data_version < DATA_VERSION
    }

    /// Encodes the record for storage.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|source| Error::Json {
                record: "host",
                source,
            })
    }

    /// Decodes a stored host record.
    ///
    /// # Errors
    /// Returns an error if the bytes are not a valid host record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|source| Error::Json {
            record: "host",
            source,
        })
    }
}
