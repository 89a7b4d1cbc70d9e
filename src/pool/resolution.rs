//! Per-request connect state machine.
//!
//! A [`ConnectResolution`] turns the endpoint list of one `create` call into a
//! connection: it resolves every endpoint into connectors, asks the pool
//! whether someone already has (or is getting) a connection to one of them,
//! and otherwise tries the connectors in order.

use super::registry::WaitOutcome;
use super::{Lookup, PoolShared};
use crate::base::neterror::NetError;
use crate::connection::Connection;
use crate::scheduler::run_blocking;
use crate::transport::{ConnectorInfo, Endpoint};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

pub(crate) type ConnectReply = oneshot::Sender<Result<(Arc<Connection>, bool), NetError>>;

/// Where a resolution is in its walk over endpoints and connectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    /// Resolving the endpoint at this index.
    ResolvingEndpoint(usize),
    /// Connecting through the connector at this index.
    AttemptingConnector(usize),
    Succeeded,
    Failed,
}

pub(crate) struct ConnectResolution {
    pool: Weak<PoolShared>,
    endpoints: Vec<Endpoint>,
    has_more: bool,
    connectors: Vec<ConnectorInfo>,
    state: ResolutionState,
    reply: Option<ConnectReply>,
}

impl ConnectResolution {
    pub fn new(
        pool: Weak<PoolShared>,
        endpoints: Vec<Endpoint>,
        has_more: bool,
        reply: ConnectReply,
    ) -> Self {
        Self {
            pool,
            endpoints,
            has_more,
            connectors: Vec::new(),
            state: ResolutionState::ResolvingEndpoint(0),
            reply: Some(reply),
        }
    }

    /// Drives the resolution to completion and delivers the result.
    pub async fn run(mut self) {
        let result = self.drive().await;
        self.state = match result {
            Ok(_) => ResolutionState::Succeeded,
            Err(_) => ResolutionState::Failed,
        };
        tracing::trace!(state = ?self.state, "connect resolution finished");

        if let Some(reply) = self.reply.take() {
            // The caller may have stopped waiting; the connection stays pooled.
            let _ = reply.send(result);
        }
    }

    fn pool(&self) -> Result<Arc<PoolShared>, NetError> {
        self.pool.upgrade().ok_or(NetError::PoolDestroyed)
    }

    async fn drive(&mut self) -> Result<(Arc<Connection>, bool), NetError> {
        self.resolve_endpoints().await?;
        self.acquire().await
    }

    async fn resolve_endpoints(&mut self) -> Result<(), NetError> {
        let mut last_error = None;

        for i in 0..self.endpoints.len() {
            self.state = ResolutionState::ResolvingEndpoint(i);
            let endpoint = self.endpoints[i].clone();
            let pool = self.pool()?;

            match endpoint.resolve_connectors(pool.resolver()).await {
                Ok(connectors) => {
                    tracing::trace!(endpoint = %endpoint, count = connectors.len(), "endpoint resolved");
                    for connector in connectors {
                        // The first endpoint resolving to a connector owns it.
                        if self.connectors.iter().any(|info| info.connector == connector) {
                            continue;
                        }
                        self.connectors.push(ConnectorInfo::new(connector, endpoint.clone()));
                    }
                }
                Err(e) if e.is_destroyed() => return Err(e),
                Err(e) => {
                    let more = self.has_more || i + 1 < self.endpoints.len();
                    if more {
                        tracing::debug!(endpoint = %endpoint, error = %e, "endpoint resolution failed, trying next");
                    } else {
                        tracing::info!(endpoint = %endpoint, error = %e, "endpoint resolution failed");
                    }
                    last_error = Some(e);
                }
            }
        }

        if self.connectors.is_empty() {
            return Err(last_error.unwrap_or(NetError::NameNotResolved));
        }
        Ok(())
    }

    /// Registers with the pool until it either hands out a connection or
    /// makes this resolution the one that connects.
    async fn acquire(&mut self) -> Result<(Arc<Connection>, bool), NetError> {
        loop {
            if self.connectors.is_empty() {
                return Err(NetError::ConnectionFailed);
            }

            let lookup = self.pool()?.get_connection(&self.connectors)?;
            match lookup {
                Lookup::Live(connection, compress) => return Ok((connection, compress)),
                Lookup::Drive => return self.connect().await,
                Lookup::Wait(outcome) => match outcome.await {
                    Ok(WaitOutcome::Done(result)) => return result,
                    Ok(WaitOutcome::Retry { failed }) => {
                        self.connectors.retain(|info| !failed.contains(&info.connector));
                    }
                    Err(_) => return Err(NetError::PoolDestroyed),
                },
            }
        }
    }

    /// Tries the owned connectors in order, then reports to the pool.
    async fn connect(&mut self) -> Result<(Arc<Connection>, bool), NetError> {
        let mut last_error = NetError::ConnectionFailed;

        for j in 0..self.connectors.len() {
            self.state = ResolutionState::AttemptingConnector(j);
            let info = self.connectors[j].clone();
            let pool = self.pool()?;

            match connect_through(&pool, &info).await {
                Ok(connection) => {
                    let compress = pool.compress_for(&info.endpoint);
                    pool.finish_get_connection(&self.connectors, Ok((&info, &connection)));
                    return Ok((connection, compress));
                }
                Err(e) => {
                    let stop = e.stops_connector_fallback();
                    let more = !stop && j + 1 < self.connectors.len();
                    if more || self.has_more {
                        tracing::debug!(connector = %info.connector, error = %e, "connection attempt failed");
                    } else {
                        tracing::info!(connector = %info.connector, error = %e, "connection attempt failed");
                    }
                    last_error = e;
                    if stop {
                        break;
                    }
                }
            }
        }

        if let Ok(pool) = self.pool() {
            pool.finish_get_connection(&self.connectors, Err(&last_error));
        }
        Err(last_error)
    }
}

/// One physical attempt: blocking connect, then the async handshake.
async fn connect_through(
    pool: &Arc<PoolShared>,
    info: &ConnectorInfo,
) -> Result<Arc<Connection>, NetError> {
    let connect = pool.connect.clone();
    let connector = info.connector;
    let transceiver =
        run_blocking(pool.scheduler.as_ref(), move || connect.connect(&connector)).await??;

    let connection = pool.create_connection(transceiver, info)?;
    connection.start().await?;
    connection.activate();
    // A destroy() racing with the handshake may already have closed it.
    if !connection.is_active_or_holding() {
        return Err(connection.close_reason());
    }
    Ok(connection)
}
