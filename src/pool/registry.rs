//! Bookkeeping behind the pool lock: live connections and pending connects.

use crate::base::neterror::NetError;
use crate::connection::Connection;
use crate::transport::{Connector, ConnectorInfo, Endpoint};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

/// Live connections, indexed by connector and by normalized endpoint.
///
/// A connection is indexed under both compression variants of its endpoint so
/// a lookup with either flag finds it.
#[derive(Debug, Default)]
pub(crate) struct LiveConnections {
    by_connector: HashMap<Connector, Vec<Arc<Connection>>>,
    by_endpoint: HashMap<Endpoint, Vec<Arc<Connection>>>,
}

impl LiveConnections {
    pub fn insert(&mut self, connection: Arc<Connection>) {
        if let Some(connector) = connection.connector() {
            self.by_connector.entry(*connector).or_default().push(connection.clone());
        }
        for key in connection.endpoint().index_keys() {
            self.by_endpoint.entry(key).or_default().push(connection.clone());
        }
    }

    /// Removes `connection` from both indexes. Returns false if it was not
    /// indexed.
    pub fn remove(&mut self, connection: &Connection) -> bool {
        let id = connection.id();
        let mut removed = false;

        if let Some(connector) = connection.connector() {
            removed |= remove_from(&mut self.by_connector, connector, id);
        }
        for key in connection.endpoint().index_keys() {
            removed |= remove_from(&mut self.by_endpoint, &key, id);
        }
        removed
    }

    /// First active-or-holding connection for any of `endpoints`, in order,
    /// with the endpoint that matched.
    pub fn find_by_endpoints<'a>(
        &self,
        endpoints: &'a [Endpoint],
    ) -> Option<(Arc<Connection>, &'a Endpoint)> {
        endpoints.iter().find_map(|endpoint| {
            self.by_endpoint
                .get(&endpoint.normalized())
                .and_then(|connections| first_usable(connections))
                .map(|connection| (connection, endpoint))
        })
    }

    /// First active-or-holding connection for any of `connectors`, in order,
    /// with the connector info that matched.
    pub fn find_by_connectors<'a>(
        &self,
        connectors: &'a [ConnectorInfo],
    ) -> Option<(Arc<Connection>, &'a ConnectorInfo)> {
        connectors.iter().find_map(|info| {
            self.by_connector
                .get(&info.connector)
                .and_then(|connections| first_usable(connections))
                .map(|connection| (connection, info))
        })
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.by_connector.values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_connector.values().map(Vec::len).sum()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.by_connector.is_empty() && self.by_endpoint.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_connector.clear();
        self.by_endpoint.clear();
    }
}

fn first_usable(connections: &[Arc<Connection>]) -> Option<Arc<Connection>> {
    connections.iter().find(|c| c.is_active_or_holding()).cloned()
}

fn remove_from<K>(map: &mut HashMap<K, Vec<Arc<Connection>>>, key: &K, id: u64) -> bool
where
    K: std::hash::Hash + Eq,
{
    let Some(connections) = map.get_mut(key) else {
        return false;
    };
    let before = connections.len();
    connections.retain(|c| c.id() != id);
    let removed = connections.len() != before;
    if connections.is_empty() {
        map.remove(key);
    }
    removed
}

/// What a waiting resolution is told when the attempt it waits on ends.
#[derive(Debug)]
pub(crate) enum WaitOutcome {
    /// Final result: a connection with its compression flag, or the error.
    Done(Result<(Arc<Connection>, bool), NetError>),
    /// Drop `failed` from the connector list and ask the pool again.
    Retry { failed: Vec<Connector> },
}

static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

/// A resolution parked on connectors someone else is connecting to.
#[derive(Debug)]
pub(crate) struct Waiter {
    id: u64,
    connectors: Vec<ConnectorInfo>,
    reply: Mutex<Option<oneshot::Sender<WaitOutcome>>>,
}

impl Waiter {
    fn new(connectors: &[ConnectorInfo]) -> (Arc<Self>, oneshot::Receiver<WaitOutcome>) {
        let (tx, rx) = oneshot::channel();
        let waiter = Arc::new(Self {
            id: NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed),
            connectors: connectors.to_vec(),
            reply: Mutex::new(Some(tx)),
        });
        (waiter, rx)
    }

    /// The waiter's own info for `connector`, if it asked for it.
    pub fn info_for(&self, connector: &Connector) -> Option<&ConnectorInfo> {
        self.connectors.iter().find(|info| info.connector == *connector)
    }

    /// Whether every connector of this waiter is in `failed`.
    pub fn covered_by(&self, failed: &[Connector]) -> bool {
        self.connectors.iter().all(|info| failed.contains(&info.connector))
    }

    /// Delivers `outcome`. Only the first call has an effect.
    pub fn resolve(&self, outcome: WaitOutcome) {
        let reply = self.reply.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(reply) = reply {
            // The resolution may be gone together with a dropped pool.
            let _ = reply.send(outcome);
        }
    }
}

/// Connectors with an attempt in flight, and who waits on each.
///
/// A key exists while the resolution that owns it is connecting; its value
/// lists the other resolutions waiting on that connector.
#[derive(Debug, Default)]
pub(crate) struct PendingConnects {
    waiters: HashMap<Connector, Vec<Arc<Waiter>>>,
}

impl PendingConnects {
    pub fn any_pending(&self, connectors: &[ConnectorInfo]) -> bool {
        connectors.iter().any(|info| self.waiters.contains_key(&info.connector))
    }

    /// Takes ownership of every connector in `connectors`.
    pub fn own(&mut self, connectors: &[ConnectorInfo]) {
        for info in connectors {
            self.waiters.entry(info.connector).or_default();
        }
    }

    /// Registers a waiter on every pending connector of `connectors`.
    pub fn wait(&mut self, connectors: &[ConnectorInfo]) -> oneshot::Receiver<WaitOutcome> {
        let (waiter, rx) = Waiter::new(connectors);
        for info in connectors {
            if let Some(waiters) = self.waiters.get_mut(&info.connector) {
                waiters.push(waiter.clone());
            }
        }
        rx
    }

    /// Removes the entries of `connectors` and returns their waiters, each
    /// once. Returned waiters are also removed from every other entry.
    pub fn take_waiters<'a>(
        &mut self,
        connectors: impl IntoIterator<Item = &'a Connector>,
    ) -> Vec<Arc<Waiter>> {
        let mut seen = HashSet::new();
        let mut taken = Vec::new();
        for connector in connectors {
            for waiter in self.waiters.remove(connector).unwrap_or_default() {
                if seen.insert(waiter.id) {
                    taken.push(waiter);
                }
            }
        }

        for waiter in &taken {
            for info in &waiter.connectors {
                if let Some(waiters) = self.waiters.get_mut(&info.connector) {
                    waiters.retain(|w| w.id != waiter.id);
                }
            }
        }
        taken
    }

    /// Takes every registered waiter. Owned connectors stay pending until
    /// their owners finish.
    pub fn drain_waiters(&mut self) -> Vec<Arc<Waiter>> {
        let mut seen = HashSet::new();
        self.waiters
            .values_mut()
            .flat_map(std::mem::take)
            .filter(|waiter| seen.insert(waiter.id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
