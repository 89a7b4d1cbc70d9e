//! Endpoint descriptors.
//!
//! An [`Endpoint`] names a service address family (protocol, host, port) plus
//! the per-endpoint options that do not change *where* we connect to:
//! the compression preference and the legacy timeout. Connections are shared
//! between requests whose endpoints differ only in those two options, which is
//! why the pool indexes endpoints by their [`normalized`](Endpoint::normalized)
//! form.

use crate::base::neterror::NetError;
use crate::dns::{Name, Resolve, SocketAddrs};
use crate::transport::connector::Connector;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Transport protocol tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Ssl,
    Ws,
    Wss,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Ssl => "ssl",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "ssl" => Ok(Protocol::Ssl),
            "ws" => Ok(Protocol::Ws),
            "wss" => Ok(Protocol::Wss),
            other => Err(NetError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Immutable description of a reachable service address.
///
/// String form: `tcp://host:port[?compress=1][&timeout=<ms>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    protocol: Protocol,
    host: String,
    port: u16,
    compress: bool,
    timeout: Option<Duration>,
}

impl Endpoint {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self { protocol, host: host.into(), port, compress: false, timeout: None }
    }

    /// Shorthand for a TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(Protocol::Tcp, host, port)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether requests sent over a connection to this endpoint should be
    /// compressed.
    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn with_compress(&self, compress: bool) -> Self {
        Self { compress, ..self.clone() }
    }

    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self { timeout, ..self.clone() }
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self { port, ..self.clone() }
    }

    /// The form used for connection lookups: timeout cleared, compression
    /// flag kept.
    pub fn normalized(&self) -> Self {
        self.with_timeout(None)
    }

    /// Keys under which a connection established through this endpoint is
    /// indexed: the normalized endpoint with compression off and on.
    pub fn index_keys(&self) -> [Endpoint; 2] {
        let normalized = self.normalized();
        [normalized.with_compress(false), normalized.with_compress(true)]
    }

    /// Resolves this endpoint into concrete connectors.
    ///
    /// IP literals are not sent to the resolver. Connectors keep the order
    /// in which the resolver returned the addresses.
    pub async fn resolve_connectors(
        &self,
        resolver: &dyn Resolve,
    ) -> Result<Vec<Connector>, NetError> {
        let ips = match SocketAddrs::try_parse(&self.host) {
            Some(ip) => vec![ip],
            None => resolver.resolve(Name::new(self.host.as_str())).await?,
        };

        if ips.is_empty() {
            return Err(NetError::NameNotResolved);
        }

        Ok(ips
            .into_iter()
            .map(|ip| Connector::new(self.protocol, SocketAddr::new(ip, self.port)))
            .collect())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "{}://[{}]:{}", self.protocol, self.host, self.port)?;
        } else {
            write!(f, "{}://{}:{}", self.protocol, self.host, self.port)?;
        }

        let mut sep = '?';
        if self.compress {
            write!(f, "{}compress=1", sep)?;
            sep = '&';
        }
        if let Some(timeout) = self.timeout {
            write!(f, "{}timeout={}", sep, timeout.as_millis())?;
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| NetError::InvalidEndpoint(format!("{}: {}", s, e)))?;
        let protocol: Protocol = url.scheme().parse()?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| NetError::InvalidEndpoint(format!("{}: missing host", s)))?;
        let port =
            url.port().ok_or_else(|| NetError::InvalidEndpoint(format!("{}: missing port", s)))?;

        let mut endpoint = Endpoint::new(protocol, host, port);
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "compress" => {
                    endpoint.compress = match value.as_ref() {
                        "1" | "true" => true,
                        "0" | "false" => false,
                        other => {
                            return Err(NetError::InvalidEndpoint(format!(
                                "{}: bad compress value {:?}",
                                s, other
                            )))
                        }
                    };
                }
                "timeout" => {
                    let ms: u64 = value.parse().map_err(|_| {
                        NetError::InvalidEndpoint(format!("{}: bad timeout {:?}", s, value))
                    })?;
                    endpoint.timeout = Some(Duration::from_millis(ms));
                }
                other => {
                    return Err(NetError::InvalidEndpoint(format!(
                        "{}: unknown option {:?}",
                        s, other
                    )))
                }
            }
        }
        Ok(endpoint)
    }
}
