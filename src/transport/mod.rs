//! Transport value types and the seams to the socket layer.
//!
//! - [`Endpoint`]: unresolved service address, resolves into connectors
//! - [`Connector`]: one resolved target, the pool's deduplication key
//! - [`Transceiver`] / [`Acceptor`]: raw channels and listening sockets
//! - [`tcp`]: the TCP implementation of all of the above

pub mod connector;
pub mod endpoint;
pub mod tcp;
pub mod transceiver;

pub use connector::{Connect, Connector, ConnectorInfo};
pub use endpoint::{Endpoint, Protocol};
pub use transceiver::{Acceptor, Transceiver};
