//! Pool and server configuration.
//!
//! Both structs deserialize from JSON; durations are given in milliseconds:
//!
//! ```json
//! { "override_compress": true, "connect_timeout_ms": 2000, "handshake_timeout_ms": null }
//! ```

use crate::base::neterror::NetError;
use serde::Deserialize;
use std::time::Duration;

/// Client-side connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Forces the compression decision returned with every connection
    pub override_compress: Option<bool>,
    /// Replaces the timeout of every endpoint passed to `create`
    #[serde(rename = "override_timeout_ms", with = "opt_millis")]
    pub override_timeout: Option<Duration>,
    /// Socket connect timeout
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Validation handshake timeout; `None` waits forever
    #[serde(rename = "handshake_timeout_ms", with = "opt_millis")]
    pub handshake_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            override_compress: None,
            override_timeout: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, NetError> {
        serde_json::from_str(json).map_err(|e| NetError::Config(format!("pool config: {}", e)))
    }

    pub fn override_compress(mut self, compress: bool) -> Self {
        self.override_compress = Some(compress);
        self
    }

    pub fn override_timeout(mut self, timeout: Duration) -> Self {
        self.override_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Accepted-connection manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Incoming connections beyond this count are closed right after accept
    pub max_connections: Option<usize>,
    #[serde(rename = "handshake_timeout_ms", with = "opt_millis")]
    pub handshake_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { max_connections: None, handshake_timeout: Some(Duration::from_secs(10)) }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, NetError> {
        serde_json::from_str(json).map_err(|e| NetError::Config(format!("server config: {}", e)))
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
