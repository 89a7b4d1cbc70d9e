use crate::base::neterror::NetError;
use crate::transport::endpoint::{Endpoint, Protocol};
use crate::transport::transceiver::Transceiver;
use std::fmt;
use std::net::SocketAddr;

/// One concrete, resolved connect target.
///
/// Connectors are the deduplication key of the pool: two requests that
/// resolve to the same connector share one connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Connector {
    protocol: Protocol,
    addr: SocketAddr,
}

impl Connector {
    pub fn new(protocol: Protocol, addr: SocketAddr) -> Self {
        Self { protocol, addr }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.addr)
    }
}

/// A connector together with the endpoint it was resolved from.
///
/// Lookups use the connector; the compression decision comes from the
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectorInfo {
    pub connector: Connector,
    pub endpoint: Endpoint,
}

impl ConnectorInfo {
    pub fn new(connector: Connector, endpoint: Endpoint) -> Self {
        Self { connector, endpoint }
    }
}

/// Opens raw transport channels.
///
/// `connect` blocks until the socket-level connection is established or
/// fails, so callers run it on the scheduler's blocking workers.
pub trait Connect: Send + Sync + fmt::Debug {
    fn connect(&self, connector: &Connector) -> Result<Box<dyn Transceiver>, NetError>;
}
