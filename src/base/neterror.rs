use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by the transport layer.
///
/// The enum is `Clone` because a single connect outcome is delivered to every
/// request that was deduplicated onto the same attempt. io errors are kept as
/// `Arc<io::Error>` for that reason.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    // Connection Errors
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Connection to {host}:{port} failed: {source}")]
    ConnectionFailedTo {
        host: String,
        port: u16,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Connect timed out")]
    ConnectTimeout,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Name {domain} not resolved: {source}")]
    NameNotResolvedFor {
        domain: String,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Address invalid")]
    AddressInvalid,
    #[error("Address in use")]
    AddressInUse,
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    // Lifecycle Errors
    #[error("Connection pool destroyed")]
    PoolDestroyed,
    #[error("Object adapter deactivated")]
    AdapterDeactivated,
    #[error("Maximum connection count reached")]
    CapacityExceeded,

    // Usage Errors
    #[error("No endpoints to connect to")]
    NoEndpoints,
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    /// Wraps an io error raised while connecting to `host:port`.
    ///
    /// Timeouts are reported as [`NetError::ConnectTimeout`] so that the
    /// connector fallback rule can recognise them.
    pub fn connection_failed_to(host: &str, port: u16, error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::TimedOut => NetError::ConnectTimeout,
            _ => NetError::ConnectionFailedTo {
                host: host.to_string(),
                port,
                source: Arc::new(error),
            },
        }
    }

    /// Wraps an io error raised while resolving `domain`.
    pub fn dns_failed(domain: &str, error: io::Error) -> Self {
        NetError::NameNotResolvedFor { domain: domain.to_string(), source: Arc::new(error) }
    }

    /// Returns true if the error means the pool was destroyed.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, NetError::PoolDestroyed)
    }

    /// Returns true if a connector failure with this error must not be
    /// followed by an attempt on the next connector.
    ///
    /// Endpoint resolution failures only stop on [`NetError::PoolDestroyed`];
    /// see [`NetError::is_destroyed`].
    pub fn stops_connector_fallback(&self) -> bool {
        matches!(self, NetError::PoolDestroyed | NetError::ConnectTimeout)
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::ConnectionClosed => -100,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::ConnectionFailedTo { .. } => -104,
            NetError::NameNotResolved => -105,
            NetError::NameNotResolvedFor { .. } => -105,
            NetError::AddressInvalid => -108,
            NetError::AddressInUse => -147,
            NetError::ConnectTimeout => -118,
            NetError::HandshakeFailed(_) => -107,

            // Custom codes start at -10000
            NetError::PoolDestroyed => -10000,
            NetError::AdapterDeactivated => -10001,
            NetError::CapacityExceeded => -10002,
            NetError::NoEndpoints => -10003,
            NetError::UnsupportedProtocol(_) => -10004,
            NetError::InvalidEndpoint(_) => -10005,
            NetError::Config(_) => -10006,
            NetError::Unknown(code) => *code,
        }
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -100 => NetError::ConnectionClosed,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -108 => NetError::AddressInvalid,
            -118 => NetError::ConnectTimeout,
            -147 => NetError::AddressInUse,
            -10000 => NetError::PoolDestroyed,
            -10001 => NetError::AdapterDeactivated,
            -10002 => NetError::CapacityExceeded,
            -10003 => NetError::NoEndpoints,
            _ => NetError::Unknown(code),
        }
    }
}
