use crate::Error;

use std::fmt;
use std::net::IpAddr;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use cidr::IpInet;
use tokio::process::Command;
use tracing::debug;
use vipd_serializer::Backend;

/// Number of gratuitous ARP replies sent per announcement.
const ANNOUNCE_COUNT: &str = "3";

/// Default bound on a single command, announcement included.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// A system command touching interface addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetCommand {
    /// `ip addr add <address> dev <interface>`
    AddAddress {
        /// Address with prefix length.
        address: IpInet,
        /// Interface name.
        interface: String,
    },

    /// `ip addr del <address> dev <interface>`
    DeleteAddress {
        /// Address with prefix length.
        address: IpInet,
        /// Interface name.
        interface: String,
    },

    /// `ip -o addr show dev <interface> to <address>`
    ShowAddress {
        /// Address with prefix length.
        address: IpInet,
        /// Interface name.
        interface: String,
    },

    /// `arping -U -c 3 -I <interface> <address>`
    Announce {
        /// Address to announce.
        address: IpAddr,
        /// Interface name.
        interface: String,
    },
}

fn with_length(address: &IpInet) -> String {
    format!("{}/{}", address.address(), address.network_length())
}

impl NetCommand {
    /// The program this command runs.
    #[must_use]
    pub const fn program(&self) -> &'static str {
        match self {
            Self::AddAddress { .. } | Self::DeleteAddress { .. } | Self::ShowAddress { .. } => {
                "ip"
            }
            Self::Announce { .. } => "arping",
        }
    }

    /// The program's arguments.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::AddAddress { address, interface } => {
                vec![
                    "addr".into(),
                    "add".into(),
                    with_length(address),
                    "dev".into(),
                    interface.clone(),
                ]
            }
            Self::DeleteAddress { address, interface } => {
                vec![
                    "addr".into(),
                    "del".into(),
                    with_length(address),
                    "dev".into(),
                    interface.clone(),
                ]
            }
            Self::ShowAddress { address, interface } => {
                vec![
                    "-o".into(),
                    "addr".into(),
                    "show".into(),
                    "dev".into(),
                    interface.clone(),
                    "to".into(),
                    with_length(address),
                ]
            }
            Self::Announce { address, interface } => {
                vec![
                    "-U".into(),
                    "-c".into(),
                    ANNOUNCE_COUNT.into(),
                    "-I".into(),
                    interface.clone(),
                    address.to_string(),
                ]
            }
        }
    }
}

impl fmt::Display for NetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program(), self.args().join(" "))
    }
}

/// Runs [`NetCommand`]s as child processes. Only ever driven through a
/// serializer so address changes never interleave.
#[derive(Debug)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    /// Creates a runner killing any command still running after `timeout`.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(COMMAND_TIMEOUT)
    }
}

/// Runs `program` to completion, killing it once `timeout` passes.
async fn run(program: &'static str, args: &[String], timeout: Duration) -> Result<Output, Error> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(output) => output.map_err(|source| Error::Spawn { program, source }),
        Err(_) => Err(Error::Timeout {
            command: format!("{program} {}", args.join(" ")),
            timeout,
        }),
    }
}

#[async_trait]
impl Backend for SystemRunner {
    type Request = NetCommand;
    type Response = Result<String, Error>;

    async fn call(&mut self, command: NetCommand) -> Result<String, Error> {
        debug!(%command, "running");

        let output = run(command.program(), &command.args(), self.timeout).await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::Exit {
                command: command.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
