//! In-process activation strategy that only records what it was asked to do.
//! Failures can be switched on per endpoint.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use vipd_model::Endpoint;
use vipd_plugin::{Error, Plugin, PluginFactory, parse_config};

/// Name endpoints use to select the mock strategy.
pub const NAME: &str = "mock";

#[derive(Deserialize)]
struct MockConfig {
    key: String,
}

/// What one endpoint's mock plugin has been asked to do.
#[derive(Debug, Default)]
pub struct MockState {
    activations: AtomicUsize,
    disables: AtomicUsize,
    ensures: AtomicUsize,
    active: AtomicBool,
    fail_activate: AtomicBool,
    fail_disable: AtomicBool,
    fail_ensure: AtomicBool,
}

impl MockState {
    /// Number of `activate` calls.
    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    /// Number of `disable` calls.
    pub fn disables(&self) -> usize {
        self.disables.load(Ordering::SeqCst)
    }

    /// Number of `ensure` calls.
    pub fn ensures(&self) -> usize {
        self.ensures.load(Ordering::SeqCst)
    }

    /// Whether the last successful hook left the resource up.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Makes `activate` fail.
    pub fn set_fail_activate(&self, fail: bool) {
        self.fail_activate.store(fail, Ordering::SeqCst);
    }

    /// Makes `disable` fail.
    pub fn set_fail_disable(&self, fail: bool) {
        self.fail_disable.store(fail, Ordering::SeqCst);
    }

    /// Makes `ensure` fail.
    pub fn set_fail_ensure(&self, fail: bool) {
        self.fail_ensure.store(fail, Ordering::SeqCst);
    }
}

/// Plugin recording into a shared [`MockState`].
#[derive(Debug)]
pub struct MockPlugin {
    key: String,
    state: Arc<MockState>,
}

#[async_trait]
impl Plugin for MockPlugin {
    async fn activate(&self) -> Result<(), Error> {
        self.state.activations.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_activate.load(Ordering::SeqCst) {
            return Err(Error::failed("activate", "injected activation failure"));
        }

        self.state.active.store(true, Ordering::SeqCst);
        debug!(key = %self.key, "mock activated");
        Ok(())
    }

    async fn disable(&self) -> Result<(), Error> {
        self.state.disables.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_disable.load(Ordering::SeqCst) {
            return Err(Error::failed("disable", "injected disable failure"));
        }

        self.state.active.store(false, Ordering::SeqCst);
        debug!(key = %self.key, "mock disabled");
        Ok(())
    }

    async fn ensure(&self) -> Result<(), Error> {
        self.state.ensures.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_ensure.load(Ordering::SeqCst) {
            return Err(Error::failed("ensure", "injected ensure failure"));
        }

        Ok(())
    }

    fn election_key(&self) -> String {
        self.key.clone()
    }
}

/// Factory handing out [`MockPlugin`]s. Plugins created for the same endpoint
/// share one [`MockState`].
#[derive(Debug, Default)]
pub struct MockFactory {
    states: Mutex<HashMap<String, Arc<MockState>>>,
}

impl MockFactory {
    /// Creates a factory with no recorded endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State of the endpoint's plugin, created on first use.
    pub fn state(&self, endpoint_id: &str) -> Arc<MockState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint_id.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl PluginFactory for MockFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn validate(&self, endpoint: &Endpoint) -> Result<(), Error> {
        let config: MockConfig = parse_config(NAME, endpoint)?;
        if config.key.is_empty() {
            return Err(Error::InvalidConfig {
                plugin: NAME.to_string(),
                reason: "key must not be empty".to_string(),
            });
        }

        Ok(())
    }

    async fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn Plugin>, Error> {
        let config: MockConfig = parse_config(NAME, endpoint)?;

        Ok(Arc::new(MockPlugin {
            key: config.key,
            state: self.state(&endpoint.id),
        }))
    }
}
