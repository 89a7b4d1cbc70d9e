//! Outgoing connection pool.
//!
//! [`ConnectionPool::create`] hands out a shared connection for a list of
//! endpoints. Requests that resolve to overlapping connectors share one
//! physical connect attempt: the first request to claim a connector drives
//! the attempt, later ones wait and are resolved together with it.
//!
//! All pool bookkeeping sits behind one lock. Name resolution, connects and
//! handshakes run outside of it, in [`ConnectResolution`](resolution) tasks
//! spawned on the pool's [`Scheduler`].

mod registry;
pub mod resolution;

use crate::base::neterror::NetError;
use crate::config::PoolConfig;
use crate::connection::{Adapter, Connection, ConnectionObserver};
use crate::dns::{GaiResolver, Resolve};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::transport::tcp::TcpConnect;
use crate::transport::{Connect, ConnectorInfo, Endpoint, Transceiver};
use registry::{LiveConnections, PendingConnects, WaitOutcome};
use resolution::ConnectResolution;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{oneshot, Notify};

pub use resolution::ResolutionState;

/// Result of asking the pool for a connection to a set of connectors.
pub(crate) enum Lookup {
    /// A live connection and its compression flag.
    Live(Arc<Connection>, bool),
    /// Another resolution is connecting to one of the connectors.
    Wait(oneshot::Receiver<WaitOutcome>),
    /// The caller now owns the connectors and must connect.
    Drive,
}

/// Builder for [`ConnectionPool`].
#[derive(Debug, Default)]
pub struct ConnectionPoolBuilder {
    config: PoolConfig,
    resolver: Option<Arc<dyn Resolve>>,
    connect: Option<Arc<dyn Connect>>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl ConnectionPoolBuilder {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Name resolver. Defaults to [`GaiResolver`].
    pub fn resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Socket connector. Defaults to [`TcpConnect`] with the configured
    /// connect timeout.
    pub fn connector(mut self, connect: Arc<dyn Connect>) -> Self {
        self.connect = Some(connect);
        self
    }

    /// Defaults to a [`TokioScheduler`] on the current runtime.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> Result<ConnectionPool, NetError> {
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current()?),
        };
        let resolver: Arc<dyn Resolve> = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(GaiResolver::new()),
        };
        let connect: Arc<dyn Connect> = match self.connect {
            Some(connect) => connect,
            None => Arc::new(TcpConnect::new(self.config.connect_timeout)),
        };

        let shared = Arc::new_cyclic(|this| PoolShared {
            this: this.clone(),
            config: self.config,
            resolver,
            connect,
            scheduler,
            state: Mutex::new(PoolState::default()),
            in_flight: Arc::new(InFlight::default()),
        });
        Ok(ConnectionPool { shared })
    }
}

/// Handle to a connection pool. Clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ConnectionPool")
            .field("destroyed", &state.destroyed)
            .field("connections", &state.live.len())
            .field("pending_connectors", &state.pending.len())
            .field("in_flight", &self.shared.in_flight.count.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionPool {
    pub fn builder() -> ConnectionPoolBuilder {
        ConnectionPoolBuilder::default()
    }

    /// Pool with the default resolver, connector and scheduler.
    pub fn new(config: PoolConfig) -> Result<Self, NetError> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Returns a connection to one of `endpoints` and whether requests sent
    /// over it should be compressed.
    ///
    /// Endpoints are tried in order. `has_more` tells the pool the caller
    /// has other endpoints to fall back on, which only lowers the log level of
    /// the final failure.
    ///
    /// Dropping the returned future does not cancel the connect attempt; a
    /// connection established after the caller left stays in the pool.
    pub async fn create(
        &self,
        endpoints: Vec<Endpoint>,
        has_more: bool,
    ) -> Result<(Arc<Connection>, bool), NetError> {
        if endpoints.is_empty() {
            return Err(NetError::NoEndpoints);
        }
        let endpoints = self.shared.apply_overrides(endpoints);

        if let Some(hit) = self.shared.find_connection(&endpoints)? {
            return Ok(hit);
        }

        let (tx, rx) = oneshot::channel();
        let resolution = ConnectResolution::new(Arc::downgrade(&self.shared), endpoints, has_more, tx);
        let guard = InFlightGuard::new(&self.shared.in_flight);
        self.shared.scheduler.execute(Box::pin(async move {
            let _guard = guard;
            resolution.run().await;
        }));

        rx.await.unwrap_or(Err(NetError::PoolDestroyed))
    }

    /// Closes every connection and fails every waiting request with
    /// [`NetError::PoolDestroyed`]. Later calls to `create` fail the same way.
    pub fn destroy(&self) {
        let (connections, waiters) = {
            let mut state = self.shared.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            (state.live.all(), state.pending.drain_waiters())
        };
        tracing::info!(
            connections = connections.len(),
            waiters = waiters.len(),
            "destroying connection pool"
        );

        for waiter in waiters {
            waiter.resolve(WaitOutcome::Done(Err(NetError::PoolDestroyed)));
        }
        for connection in connections {
            connection.destroy(NetError::PoolDestroyed);
        }
        self.shared.in_flight.idle.notify_waiters();
    }

    /// Waits until no connect is in flight and every connection has finished
    /// closing. The indexes are only cleared once the pool is destroyed, so
    /// connections created concurrently on a live pool stay pooled.
    pub async fn wait_until_finished(&self) {
        loop {
            let idle = self.shared.in_flight.idle.notified();
            if self.shared.is_quiescent() {
                break;
            }
            idle.await;
        }

        let connections = self.shared.lock().live.all();
        for connection in connections {
            connection.wait_until_finished().await;
        }

        let mut state = self.shared.lock();
        if state.destroyed {
            state.live.clear();
        }
        drop(state);
        tracing::debug!("connection pool finished");
    }

    /// Adapter attached to connections created from now on.
    pub fn set_default_adapter(&self, adapter: Option<Arc<dyn Adapter>>) {
        self.shared.lock().default_adapter = adapter;
    }

    pub fn default_adapter(&self) -> Option<Arc<dyn Adapter>> {
        self.shared.lock().default_adapter.clone()
    }

    /// Detaches `adapter` from every live connection using it.
    pub fn remove_adapter(&self, adapter: &Arc<dyn Adapter>) {
        for connection in self.connections() {
            let attached = connection
                .adapter()
                .is_some_and(|a| std::ptr::addr_eq(Arc::as_ptr(&a), Arc::as_ptr(adapter)));
            if attached {
                connection.set_adapter(None);
            }
        }
    }

    /// Flushes queued batch requests on every usable connection.
    pub async fn flush_batch_requests(&self) {
        for connection in self.connections() {
            if let Err(e) = connection.flush_batch_requests().await {
                tracing::debug!(connection = connection.id(), error = %e, "batch flush failed");
            }
        }
    }

    /// Snapshot of the active-or-holding connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut connections = self.shared.lock().live.all();
        connections.retain(|c| c.is_active_or_holding());
        connections
    }

    /// Number of `create` calls with a connect still in flight.
    pub fn pending_connect_count(&self) -> usize {
        self.shared.in_flight.count.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().destroyed
    }
}

#[derive(Default)]
struct PoolState {
    destroyed: bool,
    live: LiveConnections,
    pending: PendingConnects,
    default_adapter: Option<Arc<dyn Adapter>>,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn new(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        Self(in_flight.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub(crate) struct PoolShared {
    this: Weak<PoolShared>,
    config: PoolConfig,
    resolver: Arc<dyn Resolve>,
    pub(crate) connect: Arc<dyn Connect>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    state: Mutex<PoolState>,
    in_flight: Arc<InFlight>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn resolver(&self) -> &dyn Resolve {
        self.resolver.as_ref()
    }

    pub(crate) fn compress_for(&self, endpoint: &Endpoint) -> bool {
        self.config.override_compress.unwrap_or(endpoint.compress())
    }

    fn apply_overrides(&self, endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
        match self.config.override_timeout {
            Some(timeout) => endpoints.iter().map(|e| e.with_timeout(Some(timeout))).collect(),
            None => endpoints,
        }
    }

    fn is_quiescent(&self) -> bool {
        self.in_flight.count.load(Ordering::SeqCst) == 0 && self.lock().pending.is_empty()
    }

    /// Endpoint-index lookup done by `create` before any resolution starts.
    fn find_connection(
        &self,
        endpoints: &[Endpoint],
    ) -> Result<Option<(Arc<Connection>, bool)>, NetError> {
        let state = self.lock();
        if state.destroyed {
            return Err(NetError::PoolDestroyed);
        }
        Ok(state
            .live
            .find_by_endpoints(endpoints)
            .map(|(connection, endpoint)| (connection, self.compress_for(endpoint))))
    }

    /// Looks up a live connection for `connectors`, or registers the caller
    /// as waiter on, or owner of, the connectors.
    pub(crate) fn get_connection(&self, connectors: &[ConnectorInfo]) -> Result<Lookup, NetError> {
        let mut state = self.lock();
        if state.destroyed {
            return Err(NetError::PoolDestroyed);
        }

        if let Some((connection, info)) = state.live.find_by_connectors(connectors) {
            return Ok(Lookup::Live(connection, self.compress_for(&info.endpoint)));
        }

        if state.pending.any_pending(connectors) {
            return Ok(Lookup::Wait(state.pending.wait(connectors)));
        }

        state.pending.own(connectors);
        Ok(Lookup::Drive)
    }

    /// Wraps a freshly connected transceiver and indexes the connection.
    pub(crate) fn create_connection(
        &self,
        transceiver: Box<dyn Transceiver>,
        info: &ConnectorInfo,
    ) -> Result<Arc<Connection>, NetError> {
        let mut state = self.lock();
        if state.destroyed {
            drop(state);
            transceiver.close();
            return Err(NetError::PoolDestroyed);
        }

        let observer: Weak<dyn ConnectionObserver> = self.this.clone();
        let connection = Connection::outgoing(
            transceiver,
            info,
            state.default_adapter.clone(),
            observer,
            self.config.handshake_timeout,
        );
        state.live.insert(connection.clone());
        Ok(connection)
    }

    /// Releases the connectors owned by a finished attempt and settles their
    /// waiters.
    ///
    /// On success, waiters that asked for the connector that succeeded get the
    /// connection; the others ask again. On failure, waiters with no
    /// connector left outside `connectors` get the error; the others drop the
    /// failed connectors and ask again.
    pub(crate) fn finish_get_connection(
        &self,
        connectors: &[ConnectorInfo],
        outcome: Result<(&ConnectorInfo, &Arc<Connection>), &NetError>,
    ) {
        let mut state = self.lock();
        let waiters = state.pending.take_waiters(connectors.iter().map(|info| &info.connector));

        match outcome {
            Ok((used, connection)) => {
                for waiter in waiters {
                    match waiter.info_for(&used.connector) {
                        Some(info) => {
                            let compress = self.compress_for(&info.endpoint);
                            waiter.resolve(WaitOutcome::Done(Ok((connection.clone(), compress))));
                        }
                        None => waiter.resolve(WaitOutcome::Retry { failed: Vec::new() }),
                    }
                }
            }
            Err(error) => {
                let failed: Vec<_> = connectors.iter().map(|info| info.connector).collect();
                for waiter in waiters {
                    if waiter.covered_by(&failed) {
                        waiter.resolve(WaitOutcome::Done(Err(error.clone())));
                    } else {
                        waiter.resolve(WaitOutcome::Retry { failed: failed.clone() });
                    }
                }
            }
        }
        drop(state);

        self.in_flight.idle.notify_waiters();
    }
}

impl ConnectionObserver for PoolShared {
    fn connection_closed(&self, connection: &Connection) {
        let removed = self.lock().live.remove(connection);
        if removed {
            tracing::debug!(connection = connection.id(), endpoint = %connection.endpoint(), "connection removed from pool");
        }
        self.in_flight.idle.notify_waiters();
    }
}
