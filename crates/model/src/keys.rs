use crate::Error;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

/// Characters that cannot appear verbatim inside a key segment.
const SEGMENT: &AsciiSet = &CONTROLS.add(b'/').add(b'%').add(b' ');

/// Escapes a resource identifier so it can be used as a single key segment.
///
/// `10.0.0.1/32` becomes `10.0.0.1%2F32`.
#[must_use]
pub fn storable_id(id: &str) -> String {
    utf8_percent_encode(id, SEGMENT).to_string()
}

/// Builds every key vipd reads or writes.
///
/// ```text
/// <root>/hosts/<hostname>/<endpointID>
/// <root>/config/<hostname>
/// <root>/ips/<storable-resource-id>/<hostname>
/// <root>/default/<electionKey>
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyLayout {
    root: String,
}

impl KeyLayout {
    /// Creates a layout rooted at `root`. Trailing slashes are ignored.
    #[must_use]
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    /// The root every key is placed under.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Prefix holding the endpoints configured on `hostname`.
    #[must_use]
    pub fn host_endpoints(&self, hostname: &str) -> String {
        format!("{}/hosts/{hostname}/", self.root)
    }

    /// Key of one endpoint configured on `hostname`.
    #[must_use]
    pub fn endpoint(&self, hostname: &str, endpoint_id: &str) -> String {
        format!("{}{endpoint_id}", self.host_endpoints(hostname))
    }

    /// Extracts the endpoint identity from an endpoint key.
    ///
    /// # Errors
    /// Returns an error if `key` is not an endpoint key of `hostname`.
    pub fn endpoint_id<'a>(&self, hostname: &str, key: &'a str) -> Result<&'a str, Error> {
        let prefix = self.host_endpoints(hostname);
        key.strip_prefix(prefix.as_str())
            .ok_or_else(|| Error::UnexpectedKey {
                key: key.to_string(),
                prefix,
            })
    }

    /// Key of the host record.
    #[must_use]
    pub fn host(&self, hostname: &str) -> String {
        format!("{}/config/{hostname}", self.root)
    }

    /// Prefix holding every host serving `resource_id`.
    #[must_use]
    pub fn links(&self, resource_id: &str) -> String {
        format!("{}/ips/{}/", self.root, storable_id(resource_id))
    }

    /// Key marking that `hostname` serves `resource_id`.
    #[must_use]
    pub fn link(&self, resource_id: &str, hostname: &str) -> String {
        format!("{}{hostname}", self.links(resource_id))
    }

    /// The mutual-exclusion key for `election_key`.
    #[must_use]
    pub fn lock(&self, election_key: &str) -> String {
        format!("{}/default/{election_key}", self.root)
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new("/vipd")
    }
}
