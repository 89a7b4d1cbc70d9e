//! Established transport sessions.
//!
//! A [`Connection`] owns one [`Transceiver`] and walks the states
//! `NotValidated → Holding ⇄ Active → Closing → Finished`. Whoever created the
//! connection (the pool or the accepted-connection manager) is told exactly
//! once, through [`ConnectionObserver`], when it reaches `Finished`.

use crate::base::neterror::NetError;
use crate::transport::{Connector, ConnectorInfo, Endpoint, Transceiver};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle states, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Handshake not completed yet.
    NotValidated,
    /// Validated and dispatching.
    Active,
    /// Validated, dispatch paused.
    Holding,
    /// Close requested; the transceiver is still in use.
    Closing,
    /// Transceiver closed.
    Finished,
}

/// Dispatch target attached to a connection.
///
/// Request dispatch lives outside this crate; connections only carry the
/// handle so the owner can swap or clear it.
pub trait Adapter: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
}

/// Receives the closure notification of connections it created.
pub trait ConnectionObserver: Send + Sync {
    fn connection_closed(&self, connection: &Connection);
}

struct Inner {
    adapter: Option<Arc<dyn Adapter>>,
    close_reason: Option<NetError>,
    batch: Vec<Bytes>,
}

pub struct Connection {
    id: u64,
    endpoint: Endpoint,
    connector: Option<Connector>,
    handshake_timeout: Option<Duration>,
    observer: Weak<dyn ConnectionObserver>,
    state: watch::Sender<ConnectionState>,
    transceiver: Mutex<Option<Box<dyn Transceiver>>>,
    // Serializes handshake and batch flushes, the two users of the transceiver.
    io: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
}

impl Connection {
    /// Wraps a transceiver we connected through `info`.
    pub fn outgoing(
        transceiver: Box<dyn Transceiver>,
        info: &ConnectorInfo,
        adapter: Option<Arc<dyn Adapter>>,
        observer: Weak<dyn ConnectionObserver>,
        handshake_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Self::new(
            transceiver,
            info.endpoint.normalized(),
            Some(info.connector),
            adapter,
            observer,
            handshake_timeout,
        )
    }

    /// Wraps a transceiver accepted on `endpoint`.
    pub fn incoming(
        transceiver: Box<dyn Transceiver>,
        endpoint: Endpoint,
        adapter: Option<Arc<dyn Adapter>>,
        observer: Weak<dyn ConnectionObserver>,
        handshake_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Self::new(transceiver, endpoint, None, adapter, observer, handshake_timeout)
    }

    fn new(
        transceiver: Box<dyn Transceiver>,
        endpoint: Endpoint,
        connector: Option<Connector>,
        adapter: Option<Arc<dyn Adapter>>,
        observer: Weak<dyn ConnectionObserver>,
        handshake_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::NotValidated);
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            connector,
            handshake_timeout,
            observer,
            state,
            transceiver: Mutex::new(Some(transceiver)),
            io: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner { adapter, close_reason: None, batch: Vec::new() }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The normalized endpoint this connection was established through.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The connector used to establish the connection; `None` for incoming
    /// connections.
    pub fn connector(&self) -> Option<&Connector> {
        self.connector.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns true once validated and until a close is requested.
    pub fn is_active_or_holding(&self) -> bool {
        matches!(self.state(), ConnectionState::Active | ConnectionState::Holding)
    }

    pub fn adapter(&self) -> Option<Arc<dyn Adapter>> {
        self.inner().adapter.clone()
    }

    pub fn set_adapter(&self, adapter: Option<Arc<dyn Adapter>>) {
        self.inner().adapter = adapter;
    }

    /// The reason passed to [`destroy`](Self::destroy), or
    /// [`NetError::ConnectionClosed`] if the connection is still open.
    pub fn close_reason(&self) -> NetError {
        self.inner().close_reason.clone().unwrap_or(NetError::ConnectionClosed)
    }

    /// Runs the connection handshake.
    ///
    /// On success the connection is `Holding`; the owner decides whether to
    /// [`activate`](Self::activate) it. On failure the connection destroys
    /// itself with the handshake error.
    pub async fn start(&self) -> Result<(), NetError> {
        let _io = self.io.lock().await;

        match self.state() {
            ConnectionState::NotValidated => {}
            ConnectionState::Active | ConnectionState::Holding => return Ok(()),
            ConnectionState::Closing | ConnectionState::Finished => {
                return Err(self.close_reason())
            }
        }
        let Some(mut transceiver) = self.take_transceiver() else {
            return Err(self.close_reason());
        };

        let result = match self.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, transceiver.initialize())
                .await
                .unwrap_or(Err(NetError::ConnectTimeout)),
            None => transceiver.initialize().await,
        };
        *self.lock_transceiver() = Some(transceiver);

        let outcome = match result {
            Ok(()) => {
                let validated = self.state.send_if_modified(|state| {
                    if *state == ConnectionState::NotValidated {
                        *state = ConnectionState::Holding;
                        true
                    } else {
                        false
                    }
                });
                if validated {
                    tracing::debug!(id = self.id, endpoint = %self.endpoint, "connection established");
                    Ok(())
                } else {
                    Err(self.close_reason())
                }
            }
            Err(e) => {
                tracing::debug!(id = self.id, endpoint = %self.endpoint, error = %e, "connection handshake failed");
                self.mark_closing(e.clone());
                Err(e)
            }
        };

        self.finish_if_closing();
        outcome
    }

    /// `Holding` → `Active`. Ignored in any other state.
    pub fn activate(&self) {
        self.transition(ConnectionState::Holding, ConnectionState::Active);
    }

    /// `Active` → `Holding`. Ignored in any other state.
    pub fn hold(&self) {
        self.transition(ConnectionState::Active, ConnectionState::Holding);
    }

    /// Requests the connection to close with `reason`.
    ///
    /// The transceiver is closed right away unless a handshake or flush is
    /// using it, in which case that operation closes it when it returns.
    pub fn destroy(&self, reason: NetError) {
        self.mark_closing(reason);
        self.finish_if_closing();
    }

    /// Resolves once the connection is holding, or closing.
    pub async fn wait_until_holding(&self) {
        self.wait_for(|state| state >= ConnectionState::Holding).await
    }

    /// Resolves once the connection is `Finished`.
    pub async fn wait_until_finished(&self) {
        self.wait_for(|state| state == ConnectionState::Finished).await
    }

    /// Queues an encoded request for the next batch flush.
    pub fn queue_batch_request(&self, request: Bytes) -> Result<(), NetError> {
        if self.state() >= ConnectionState::Closing {
            return Err(self.close_reason());
        }
        self.inner().batch.push(request);
        Ok(())
    }

    pub fn batch_request_count(&self) -> usize {
        self.inner().batch.len()
    }

    /// Writes every queued batch request. Returns the number written.
    pub async fn flush_batch_requests(&self) -> Result<usize, NetError> {
        let _io = self.io.lock().await;

        let batch = std::mem::take(&mut self.inner().batch);
        if batch.is_empty() {
            return Ok(0);
        }

        let Some(mut transceiver) = self.take_transceiver() else {
            return Err(self.close_reason());
        };

        let mut result = Ok(batch.len());
        for request in &batch {
            if let Err(e) = transceiver.write(request).await {
                result = Err(e);
                break;
            }
        }
        *self.lock_transceiver() = Some(transceiver);

        if let Err(e) = &result {
            tracing::debug!(id = self.id, error = %e, "batch flush failed");
            self.mark_closing(e.clone());
        }
        self.finish_if_closing();
        result
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(id = self.id, ?to, "connection state changed");
        }
    }

    fn mark_closing(&self, reason: NetError) {
        let closing = self.state.send_if_modified(|state| {
            if *state < ConnectionState::Closing {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        if closing {
            tracing::debug!(id = self.id, endpoint = %self.endpoint, reason = %reason, "closing connection");
            self.inner().close_reason = Some(reason);
        }
    }

    fn finish_if_closing(&self) {
        if self.state() != ConnectionState::Closing {
            return;
        }
        // `None` means a handshake or flush holds the transceiver; it calls
        // back here once it has put it back.
        let Some(transceiver) = self.take_transceiver() else {
            return;
        };
        transceiver.close();

        let finished = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closing {
                *state = ConnectionState::Finished;
                true
            } else {
                false
            }
        });
        if finished {
            self.inner().batch.clear();
            if let Some(observer) = self.observer.upgrade() {
                observer.connection_closed(self);
            }
        }
    }

    async fn wait_for(&self, done: impl Fn(ConnectionState) -> bool) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|state| done(*state)).await;
    }

    fn take_transceiver(&self) -> Option<Box<dyn Transceiver>> {
        self.lock_transceiver().take()
    }

    fn lock_transceiver(&self) -> MutexGuard<'_, Option<Box<dyn Transceiver>>> {
        self.transceiver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.to_string())
            .field("connector", &self.connector)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
