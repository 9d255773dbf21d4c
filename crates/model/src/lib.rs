//! Records shared by every vipd component and the coordination-store key
//! layout they are persisted under.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod endpoint;
mod error;
mod host;
mod keys;

pub use endpoint::{Endpoint, HealthCheck};
pub use error::Error;
pub use host::{DATA_VERSION, Host};
pub use keys::{KeyLayout, storable_id};
