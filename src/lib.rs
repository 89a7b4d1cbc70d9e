//! # rpcnet
//!
//! Connection management for an RPC runtime.
//!
//! The client side is a [`ConnectionPool`](pool::ConnectionPool): given an
//! ordered list of endpoints it returns a shared, validated connection,
//! resolving host names, falling back across addresses, and making sure that
//! concurrent requests for the same target share one connect attempt. The
//! server side is the
//! [`AcceptedConnectionManager`](server::AcceptedConnectionManager), which
//! accepts connections on one endpoint and drives them through the same
//! hold/activate/destroy lifecycle.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rpcnet::config::PoolConfig;
//! use rpcnet::pool::ConnectionPool;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rpcnet::base::neterror::NetError> {
//!     let pool = ConnectionPool::new(PoolConfig::default())?;
//!     let endpoints = vec!["tcp://127.0.0.1:4061".parse()?, "tcp://backup.internal:4061".parse()?];
//!     let (connection, compress) = pool.create(endpoints, false).await?;
//!     println!("connected to {} (compress: {})", connection.endpoint(), compress);
//!
//!     pool.destroy();
//!     pool.wait_until_finished().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error taxonomy and io error conversion
//! - [`config`] - Pool and server configuration
//! - [`connection`] - Established connections and their lifecycle
//! - [`dns`] - Host name resolution
//! - [`pool`] - Outgoing connection pool and connect resolution
//! - [`scheduler`] - Task, blocking-job and acceptor scheduling
//! - [`server`] - Accepted-connection manager
//! - [`transport`] - Endpoints, connectors and the TCP transport

pub mod base;
pub mod config;
pub mod connection;
pub mod dns;
pub mod pool;
pub mod scheduler;
pub mod server;
pub mod transport;
