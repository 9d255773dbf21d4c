//! Keeps each locally configured endpoint active on exactly one healthy host.
//!
//! Every endpoint gets an [`EndpointManager`] that competes for a lease-backed
//! lock named after the endpoint's election key, activates the endpoint's
//! plugin while it holds the lock, and steps down when unhealthy. The
//! [`Scheduler`] owns the managers of one host.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
pub mod fsm;
mod host;
mod manager;
mod scheduler;
mod storage;

pub use config::ManagerConfig;
pub use error::{Error, ErrorBody};
pub use fsm::{State, StateMachine};
pub use host::HostLease;
pub use manager::{EndpointManager, EndpointStatus};
pub use scheduler::Scheduler;
pub use storage::Storage;
