//! Default activation strategy: binds the endpoint's address to a local
//! interface and announces it with gratuitous ARP.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod command;
mod error;

pub use command::{NetCommand, SystemRunner};
pub use error::Error;

use std::sync::Arc;

use async_trait::async_trait;
use cidr::IpInet;
use serde::Deserialize;
use tracing::{debug, info, warn};
use vipd_model::Endpoint;
use vipd_plugin::{Plugin, PluginFactory, parse_config};
use vipd_serializer::{Backend, Serializer};

/// Name endpoints use to select this strategy.
pub const NAME: &str = "arp";

/// A backend able to run [`NetCommand`]s.
pub trait Runner: Backend<Request = NetCommand, Response = Result<String, Error>> {}

impl<T> Runner for T where T: Backend<Request = NetCommand, Response = Result<String, Error>> {}

/// Plugin configuration, e.g. `{"ip": "10.0.0.10/32", "interface": "eth0"}`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ArpConfig {
    /// Address and prefix length to bind.
    pub ip: IpInet,

    /// Interface to bind it on.
    pub interface: String,
}

/// Binds one address on one interface.
#[derive(Debug)]
pub struct ArpPlugin<R: Runner = SystemRunner> {
    config: ArpConfig,
    commands: Serializer<R>,
}

impl<R: Runner> ArpPlugin<R> {
    async fn run(&self, command: NetCommand) -> Result<String, Error> {
        self.commands.call(command).await?
    }

    async fn add_address(&self) -> Result<(), Error> {
        match self
            .run(NetCommand::AddAddress {
                address: self.config.ip,
                interface: self.config.interface.clone(),
            })
            .await
        {
            Err(e) if e.is_already_present() => {
                debug!(ip = %self.config.ip, "address already present");
                Ok(())
            }
            result => result.map(|_| ()),
        }
    }

    async fn announce(&self) -> Result<(), Error> {
        let address = self.config.ip.address();
        if !address.is_ipv4() {
            debug!(%address, "no gratuitous ARP for IPv6 addresses");
            return Ok(());
        }

        self.run(NetCommand::Announce {
            address,
            interface: self.config.interface.clone(),
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl<R: Runner> Plugin for ArpPlugin<R> {
    async fn activate(&self) -> Result<(), vipd_plugin::Error> {
        self.add_address()
            .await
            .map_err(|e| vipd_plugin::Error::failed("activate", e))?;
        self.announce()
            .await
            .map_err(|e| vipd_plugin::Error::failed("activate", e))?;

        info!(ip = %self.config.ip, interface = %self.config.interface, "address activated");
        Ok(())
    }

    async fn disable(&self) -> Result<(), vipd_plugin::Error> {
        match self
            .run(NetCommand::DeleteAddress {
                address: self.config.ip,
                interface: self.config.interface.clone(),
            })
            .await
        {
            Ok(_) => {
                info!(ip = %self.config.ip, interface = %self.config.interface, "address removed");
                Ok(())
            }
            Err(e) if e.is_already_absent() => {
                debug!(ip = %self.config.ip, "address already absent");
                Ok(())
            }
            Err(e) => Err(vipd_plugin::Error::failed("disable", e)),
        }
    }

    async fn ensure(&self) -> Result<(), vipd_plugin::Error> {
        let shown = self
            .run(NetCommand::ShowAddress {
                address: self.config.ip,
                interface: self.config.interface.clone(),
            })
            .await
            .map_err(|e| vipd_plugin::Error::failed("ensure", e))?;

        if shown.trim().is_empty() {
            warn!(ip = %self.config.ip, interface = %self.config.interface, "address missing, adding it back");
            self.add_address()
                .await
                .map_err(|e| vipd_plugin::Error::failed("ensure", e))?;
        }

        self.announce()
            .await
            .map_err(|e| vipd_plugin::Error::failed("ensure", e))
    }

    fn election_key(&self) -> String {
        self.config.ip.address().to_string()
    }
}

/// Builds [`ArpPlugin`]s sharing one command serializer.
#[derive(Debug)]
pub struct ArpFactory<R: Runner = SystemRunner> {
    commands: Serializer<R>,
}

impl<R: Runner> ArpFactory<R> {
    /// Creates a factory whose plugins all run commands through `commands`.
    #[must_use]
    pub const fn new(commands: Serializer<R>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl<R: Runner> PluginFactory for ArpFactory<R> {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn validate(&self, endpoint: &Endpoint) -> Result<(), vipd_plugin::Error> {
        let config: ArpConfig = parse_config(NAME, endpoint)?;
        if config.interface.is_empty() {
            return Err(vipd_plugin::Error::InvalidConfig {
                plugin: NAME.to_string(),
                reason: "interface must not be empty".to_string(),
            });
        }

        Ok(())
    }

    async fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn Plugin>, vipd_plugin::Error> {
        self.validate(endpoint).await?;

        Ok(Arc::new(ArpPlugin {
            config: parse_config(NAME, endpoint)?,
            commands: self.commands.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use serde_json::json;

    /// Simulates one interface holding at most one address.
    #[derive(Default)]
    struct FakeInterface {
        present: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Backend for FakeInterface {
        type Request = NetCommand;
        type Response = Result<String, Error>;

        async fn call(&mut self, command: NetCommand) -> Result<String, Error> {
            self.log.lock().unwrap().push(command.to_string());

            let exit = |stderr: &str| Error::Exit {
                command: command.to_string(),
                code: Some(2),
                stderr: stderr.to_string(),
            };

            match &command {
                NetCommand::AddAddress { .. } if self.present => {
                    Err(exit("RTNETLINK answers: File exists"))
                }
                NetCommand::AddAddress { .. } => {
                    self.present = true;
                    Ok(String::new())
                }
                NetCommand::DeleteAddress { .. } if !self.present => {
                    Err(exit("RTNETLINK answers: Cannot assign requested address"))
                }
                NetCommand::DeleteAddress { .. } => {
                    self.present = false;
                    Ok(String::new())
                }
                NetCommand::ShowAddress { address, interface } if self.present => {
                    Ok(format!("2: {interface}    inet {address} scope global {interface}\n"))
                }
                NetCommand::ShowAddress { .. } | NetCommand::Announce { .. } => Ok(String::new()),
            }
        }
    }

    fn factory() -> (ArpFactory<FakeInterface>, Arc<Mutex<Vec<String>>>) {
        let backend = FakeInterface::default();
        let log = backend.log.clone();
        (ArpFactory::new(Serializer::start(backend)), log)
    }

    fn endpoint() -> Endpoint {
        Endpoint::new(NAME, json!({ "ip": "10.0.0.10/32", "interface": "eth0" }))
    }

    #[tokio::test]
    async fn test_election_key_is_the_address() {
        let (factory, _) = factory();
        let plugin = factory.create(&endpoint()).await.unwrap();

        assert_eq!(plugin.election_key(), "10.0.0.10");
    }

    #[tokio::test]
    async fn test_activate_adds_and_announces() {
        let (factory, log) = factory();
        let plugin = factory.create(&endpoint()).await.unwrap();

        plugin.activate().await.unwrap();
        // Already present is not an error.
        plugin.activate().await.unwrap();

        let log = log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "ip addr add 10.0.0.10/32 dev eth0",
                "arping -U -c 3 -I eth0 10.0.0.10",
                "ip addr add 10.0.0.10/32 dev eth0",
                "arping -U -c 3 -I eth0 10.0.0.10",
            ]
        );
    }

    #[tokio::test]
    async fn test_disable_is_idempotent() {
        let (factory, _) = factory();
        let plugin = factory.create(&endpoint()).await.unwrap();

        plugin.activate().await.unwrap();
        plugin.disable().await.unwrap();
        plugin.disable().await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_restores_missing_address() {
        let (factory, log) = factory();
        let plugin = factory.create(&endpoint()).await.unwrap();

        plugin.ensure().await.unwrap();
        plugin.ensure().await.unwrap();

        let log = log.lock().unwrap().clone();
        let adds = log.iter().filter(|line| line.starts_with("ip addr add")).count();
        assert_eq!(adds, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (factory, _) = factory();

        let missing_ip = Endpoint::new(NAME, json!({ "interface": "eth0" }));
        assert_matches!(
            factory.validate(&missing_ip).await,
            Err(vipd_plugin::Error::InvalidConfig { .. })
        );

        let bad_ip = Endpoint::new(NAME, json!({ "ip": "not-an-ip", "interface": "eth0" }));
        assert_matches!(
            factory.create(&bad_ip).await.map(|_| ()),
            Err(vipd_plugin::Error::InvalidConfig { .. })
        );

        let no_interface = Endpoint::new(NAME, json!({ "ip": "10.0.0.10/32", "interface": "" }));
        assert_matches!(
            factory.validate(&no_interface).await,
            Err(vipd_plugin::Error::InvalidConfig { .. })
        );
    }
}
