//! Server side: lifecycle of the connections accepted on one endpoint.
//!
//! An [`AcceptedConnectionManager`] owns an [`Acceptor`] and every connection
//! accepted through it. It starts out `Holding`; [`activate`] registers the
//! acceptor with the scheduler, [`hold`] unregisters it, and [`destroy`]
//! closes everything and finishes once the scheduler has confirmed the
//! acceptor is no longer watched.
//!
//! [`activate`]: AcceptedConnectionManager::activate
//! [`hold`]: AcceptedConnectionManager::hold
//! [`destroy`]: AcceptedConnectionManager::destroy

use crate::base::neterror::NetError;
use crate::config::ServerConfig;
use crate::connection::{Adapter, Connection, ConnectionObserver};
use crate::scheduler::{AcceptHandler, Registration, Scheduler, Unregistering};
use crate::transport::tcp::TcpAcceptor;
use crate::transport::{Acceptor, Endpoint, Transceiver};
use futures::future::join_all;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ManagerState {
    /// Not accepting; accepted connections are held.
    Holding,
    /// Accepting and dispatching.
    Active,
    /// Destroy requested, waiting for the scheduler to release the acceptor.
    Closing,
    /// Acceptor closed.
    Finished,
}

struct Inner {
    state: ManagerState,
    connections: Vec<Arc<Connection>>,
    registration: Option<Registration>,
    /// Accept loops asked to stop by hold() and not yet confirmed.
    unregistering: Vec<Unregistering>,
}

pub struct AcceptedConnectionManager {
    this: Weak<AcceptedConnectionManager>,
    acceptor: Arc<dyn Acceptor>,
    config: ServerConfig,
    scheduler: Arc<dyn Scheduler>,
    adapter: Option<Arc<dyn Adapter>>,
    inner: Mutex<Inner>,
    state_changes: watch::Sender<ManagerState>,
}

impl AcceptedConnectionManager {
    pub fn new(
        acceptor: Arc<dyn Acceptor>,
        config: ServerConfig,
        scheduler: Arc<dyn Scheduler>,
        adapter: Option<Arc<dyn Adapter>>,
    ) -> Arc<Self> {
        let (state_changes, _) = watch::channel(ManagerState::Holding);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            acceptor,
            config,
            scheduler,
            adapter,
            inner: Mutex::new(Inner {
                state: ManagerState::Holding,
                connections: Vec::new(),
                registration: None,
                unregistering: Vec::new(),
            }),
            state_changes,
        })
    }

    /// Binds a TCP acceptor on `endpoint` and wraps it. Port 0 binds to a
    /// free port; [`endpoint`](Self::endpoint) reports it.
    pub async fn bind(
        endpoint: &Endpoint,
        config: ServerConfig,
        scheduler: Arc<dyn Scheduler>,
        adapter: Option<Arc<dyn Adapter>>,
    ) -> Result<Arc<Self>, NetError> {
        let acceptor = TcpAcceptor::bind(endpoint).await?;
        Ok(Self::new(Arc::new(acceptor), config, scheduler, adapter))
    }

    /// The endpoint the acceptor is bound to.
    pub fn endpoint(&self) -> &Endpoint {
        self.acceptor.endpoint()
    }

    pub fn state(&self) -> ManagerState {
        self.lock().state
    }

    /// Starts accepting and activates every accepted connection.
    pub fn activate(&self) {
        let mut inner = self.lock();
        if inner.state != ManagerState::Holding {
            return;
        }
        let handler: Arc<dyn AcceptHandler> = Arc::new(WeakHandler(self.this.clone()));
        inner.registration = Some(self.scheduler.register(self.acceptor.clone(), handler));
        self.set_state(&mut inner, ManagerState::Active);

        // Applied under the lock so a racing hold() cannot reorder them.
        for connection in &inner.connections {
            connection.activate();
        }
        tracing::info!(endpoint = %self.endpoint(), "accepting connections");
    }

    /// Stops accepting and holds every accepted connection.
    pub fn hold(&self) {
        let mut inner = self.lock();
        if inner.state != ManagerState::Active {
            return;
        }
        self.set_state(&mut inner, ManagerState::Holding);

        inner.unregistering.retain_mut(|pending| !pending.is_confirmed());
        if let Some(registration) = inner.registration.take() {
            let pending = registration.unregister();
            inner.unregistering.push(pending);
        }
        for connection in &inner.connections {
            connection.hold();
        }
        tracing::info!(endpoint = %self.endpoint(), "holding connections");
    }

    /// Closes every accepted connection with
    /// [`NetError::AdapterDeactivated`] and releases the acceptor once every
    /// accept loop started by this manager has exited.
    pub fn destroy(&self) {
        let (connections, mut unregistering) = {
            let mut inner = self.lock();
            if inner.state >= ManagerState::Closing {
                return;
            }
            self.set_state(&mut inner, ManagerState::Closing);
            let mut unregistering = std::mem::take(&mut inner.unregistering);
            if let Some(registration) = inner.registration.take() {
                unregistering.push(registration.unregister());
            }
            (inner.connections.clone(), unregistering)
        };

        tracing::info!(endpoint = %self.endpoint(), connections = connections.len(), "closing acceptor");
        for connection in connections {
            connection.destroy(NetError::AdapterDeactivated);
        }

        unregistering.retain_mut(|pending| !pending.is_confirmed());
        if unregistering.is_empty() {
            self.finished();
            return;
        }

        let this = self.this.clone();
        let acceptor = self.acceptor.clone();
        self.scheduler.execute(Box::pin(async move {
            join_all(unregistering).await;
            match this.upgrade() {
                Some(this) => this.finished(),
                None => acceptor.close(),
            }
        }));
    }

    fn finished(&self) {
        {
            let mut inner = self.lock();
            self.set_state(&mut inner, ManagerState::Finished);
        }
        self.acceptor.close();
        tracing::info!(endpoint = %self.endpoint(), "acceptor finished");
    }

    /// Resolves once every accepted connection is holding or closing.
    pub async fn wait_for_hold(&self) {
        let connections = self.lock().connections.clone();
        for connection in connections {
            connection.wait_until_holding().await;
        }
    }

    /// Resolves once the manager is `Finished` and every accepted connection
    /// has closed.
    pub async fn wait_until_finished(&self) {
        let mut states = self.state_changes.subscribe();
        // The sender lives as long as `self`.
        let _ = states.wait_for(|state| *state == ManagerState::Finished).await;

        let connections = self.lock().connections.clone();
        for connection in connections {
            connection.wait_until_finished().await;
        }
        self.lock().connections.clear();
    }

    /// Snapshot of the active-or-holding accepted connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let inner = self.lock();
        inner.connections.iter().filter(|c| c.is_active_or_holding()).cloned().collect()
    }

    pub async fn flush_batch_requests(&self) {
        for connection in self.connections() {
            if let Err(e) = connection.flush_batch_requests().await {
                tracing::debug!(connection = connection.id(), error = %e, "batch flush failed");
            }
        }
    }

    fn handle_accepted(&self, transceiver: Box<dyn Transceiver>) {
        let connection = {
            let mut inner = self.lock();
            if inner.state >= ManagerState::Closing {
                drop(inner);
                transceiver.close();
                return;
            }
            if let Some(max) = self.config.max_connections {
                if inner.connections.len() >= max {
                    drop(inner);
                    tracing::debug!(
                        endpoint = %self.endpoint(),
                        max,
                        reason = %NetError::CapacityExceeded,
                        "closing accepted connection"
                    );
                    transceiver.close();
                    return;
                }
            }

            let observer: Weak<dyn ConnectionObserver> = self.this.clone();
            let connection = Connection::incoming(
                transceiver,
                self.endpoint().clone(),
                self.adapter.clone(),
                observer,
                self.config.handshake_timeout,
            );
            inner.connections.push(connection.clone());
            connection
        };

        let this = self.this.clone();
        self.scheduler.execute(Box::pin(async move {
            match connection.start().await {
                Ok(()) => {
                    if let Some(this) = this.upgrade() {
                        this.connection_validated(&connection);
                    }
                }
                Err(e) => {
                    tracing::debug!(connection = connection.id(), error = %e, "incoming connection failed");
                }
            }
        }));
    }

    fn connection_validated(&self, connection: &Connection) {
        // Checked under the lock so a concurrent hold() cannot miss it.
        let inner = self.lock();
        if inner.state == ManagerState::Active {
            connection.activate();
        }
    }

    fn set_state(&self, inner: &mut Inner, state: ManagerState) {
        inner.state = state;
        self.state_changes.send_replace(state);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConnectionObserver for AcceptedConnectionManager {
    fn connection_closed(&self, connection: &Connection) {
        let mut inner = self.lock();
        if matches!(inner.state, ManagerState::Holding | ManagerState::Active) {
            inner.connections.retain(|c| c.id() != connection.id());
        }
    }
}

impl fmt::Debug for AcceptedConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("AcceptedConnectionManager")
            .field("endpoint", &self.acceptor.endpoint().to_string())
            .field("state", &inner.state)
            .field("connections", &inner.connections.len())
            .finish()
    }
}

/// Accept handler that does not keep the manager alive.
struct WeakHandler(Weak<AcceptedConnectionManager>);

impl AcceptHandler for WeakHandler {
    fn accepted(&self, result: Result<Box<dyn Transceiver>, NetError>) {
        match (result, self.0.upgrade()) {
            (Ok(transceiver), Some(manager)) => manager.handle_accepted(transceiver),
            (Ok(transceiver), None) => transceiver.close(),
            (Err(e), _) => tracing::warn!(error = %e, "accept failed"),
        }
    }
}
