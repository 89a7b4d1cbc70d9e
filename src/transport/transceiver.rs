use crate::base::neterror::NetError;
use crate::transport::endpoint::{Endpoint, Protocol};
use futures::future::BoxFuture;
use std::fmt;

/// A raw bidirectional transport channel.
///
/// Message framing lives above this trait; the transport layer only needs
/// to validate the channel, push already-encoded bytes, and close it.
pub trait Transceiver: Send + fmt::Debug {
    fn protocol(&self) -> Protocol;

    /// Runs connection validation. Completes without blocking a thread;
    /// the runtime resumes it on I/O readiness.
    fn initialize(&mut self) -> BoxFuture<'_, Result<(), NetError>>;

    /// Writes an already-encoded payload.
    fn write<'a>(&'a mut self, buf: &'a [u8]) -> BoxFuture<'a, Result<(), NetError>>;

    /// Closes the channel.
    fn close(self: Box<Self>);
}

/// A listening socket producing incoming transceivers.
pub trait Acceptor: Send + Sync + fmt::Debug {
    /// The endpoint the acceptor is bound to, with the real port.
    fn endpoint(&self) -> &Endpoint;

    /// Waits for read readiness and accepts one connection.
    fn accept(&self) -> BoxFuture<'_, Result<Box<dyn Transceiver>, NetError>>;

    /// Stops listening. Pending and later `accept` calls fail.
    fn close(&self);
}
