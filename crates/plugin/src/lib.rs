//! Activation strategies: the contract a plugin fulfils and the registry that
//! maps configured names to plugin factories.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use vipd_model::Endpoint;

/// Name of the strategy used when an endpoint does not name one.
pub const DEFAULT_PLUGIN: &str = "arp";

/// Makes one endpoint's resource active or inactive on this host.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Brings the resource up on this host.
    async fn activate(&self) -> Result<(), Error>;

    /// Takes the resource down on this host.
    async fn disable(&self) -> Result<(), Error>;

    /// Idempotently reasserts the active configuration.
    async fn ensure(&self) -> Result<(), Error>;

    /// The name hosts compete under for this resource.
    fn election_key(&self) -> String;
}

/// Builds plugins for endpoints naming this strategy.
#[async_trait]
pub trait PluginFactory: Send + Sync + 'static {
    /// Name endpoints use to select this strategy.
    fn name(&self) -> &'static str;

    /// Checks an endpoint's configuration without side effects.
    async fn validate(&self, endpoint: &Endpoint) -> Result<(), Error>;

    /// Builds the plugin for `endpoint`.
    async fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn Plugin>, Error>;
}

/// Decodes an endpoint's plugin configuration.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] when the configuration does not match `T`.
pub fn parse_config<T: DeserializeOwned>(plugin: &str, endpoint: &Endpoint) -> Result<T, Error> {
    serde_json::from_value(endpoint.plugin_config.clone()).map_err(|e| Error::InvalidConfig {
        plugin: plugin.to_string(),
        reason: e.to_string(),
    })
}

/// Name to factory lookup.
#[derive(Clone)]
pub struct Registry {
    factories: HashMap<&'static str, Arc<dyn PluginFactory>>,
    default: String,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("factories", &self.names())
            .field("default", &self.default)
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_PLUGIN)
    }
}

impl Registry {
    /// Creates an empty registry falling back to `default` for unnamed endpoints.
    #[must_use]
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            factories: HashMap::new(),
            default: default.into(),
        }
    }

    /// Adds a factory, replacing any previous one with the same name.
    #[must_use]
    pub fn with(mut self, factory: Arc<dyn PluginFactory>) -> Self {
        self.factories.insert(factory.name(), factory);
        self
    }

    /// The strategy name an endpoint actually uses.
    #[must_use]
    pub fn resolve_name<'a>(&'a self, name: &'a str) -> &'a str {
        if name.is_empty() { &self.default } else { name }
    }

    /// Looks up the factory for `name`, or the default when empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown names.
    pub fn get(&self, name: &str) -> Result<Arc<dyn PluginFactory>, Error> {
        let name = self.resolve_name(name);
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use serde::Deserialize;

    struct Noop(String);

    #[async_trait]
    impl Plugin for Noop {
        async fn activate(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn disable(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn ensure(&self) -> Result<(), Error> {
            Ok(())
        }

        fn election_key(&self) -> String {
            self.0.clone()
        }
    }

    #[derive(Deserialize)]
    struct NoopConfig {
        key: String,
    }

    struct NoopFactory;

    #[async_trait]
    impl PluginFactory for NoopFactory {
        fn name(&self) -> &'static str {
            "noop"
        }

        async fn validate(&self, endpoint: &Endpoint) -> Result<(), Error> {
            parse_config::<NoopConfig>(self.name(), endpoint).map(|_| ())
        }

        async fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn Plugin>, Error> {
            let config: NoopConfig = parse_config(self.name(), endpoint)?;
            Ok(Arc::new(Noop(config.key)))
        }
    }

    #[tokio::test]
    async fn test_lookup_by_name_and_default() {
        let registry = Registry::new("noop").with(Arc::new(NoopFactory));

        assert_eq!(registry.get("noop").unwrap().name(), "noop");
        assert_eq!(registry.get("").unwrap().name(), "noop");
        assert_matches!(registry.get("arp").map(|_| ()), Err(Error::NotFound(name)) if name == "arp");
    }

    #[tokio::test]
    async fn test_default_registry_has_no_factories() {
        let registry = Registry::default();

        assert!(registry.names().is_empty());
        assert_matches!(registry.get("").map(|_| ()), Err(Error::NotFound(name)) if name == DEFAULT_PLUGIN);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let factory = NoopFactory;
        let endpoint = Endpoint::new("noop", serde_json::json!({ "other": 1 }));

        assert_matches!(
            factory.validate(&endpoint).await,
            Err(Error::InvalidConfig { plugin, .. }) if plugin == "noop"
        );

        let endpoint = Endpoint::new("noop", serde_json::json!({ "key": "k1" }));
        let plugin = factory.create(&endpoint).await.unwrap();
        assert_eq!(plugin.election_key(), "k1");
    }
}
