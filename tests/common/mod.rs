//! Test doubles shared by the integration tests.
#![allow(dead_code)]

use futures::future::BoxFuture;
use rpcnet::base::neterror::NetError;
use rpcnet::dns::{Name, Resolve, Resolving};
use rpcnet::transport::{Acceptor, Connect, Connector, Endpoint, Protocol, Transceiver};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn ip(last: u8) -> IpAddr {
    IpAddr::from([10, 0, 0, last])
}

pub fn addr(last: u8, port: u16) -> SocketAddr {
    SocketAddr::new(ip(last), port)
}

/// Transceiver whose handshake sleeps for `handshake_delay` and succeeds.
#[derive(Debug)]
pub struct MockTransceiver {
    handshake_delay: Duration,
    handshake_error: Option<NetError>,
    closed: Arc<AtomicUsize>,
}

impl MockTransceiver {
    pub fn new(handshake_delay: Duration, closed: Arc<AtomicUsize>) -> Self {
        Self { handshake_delay, handshake_error: None, closed }
    }

    pub fn failing(error: NetError, closed: Arc<AtomicUsize>) -> Self {
        Self { handshake_delay: Duration::ZERO, handshake_error: Some(error), closed }
    }
}

impl Transceiver for MockTransceiver {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn initialize(&mut self) -> BoxFuture<'_, Result<(), NetError>> {
        Box::pin(async move {
            tokio::time::sleep(self.handshake_delay).await;
            match &self.handshake_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        })
    }

    fn write<'a>(&'a mut self, _buf: &'a [u8]) -> BoxFuture<'a, Result<(), NetError>> {
        Box::pin(async { Ok(()) })
    }

    fn close(self: Box<Self>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// How [`MockConnect`] answers for one address.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(NetError),
    HandshakeFail(NetError),
}

/// Connector that records every call and answers from a table. Unknown
/// addresses succeed.
#[derive(Debug, Default)]
pub struct MockConnect {
    behaviors: Mutex<HashMap<SocketAddr, Behavior>>,
    calls: Mutex<HashMap<SocketAddr, usize>>,
    delay: Duration,
    pub closed: Arc<AtomicUsize>,
}

impl MockConnect {
    /// `delay` is spent blocking inside `connect`.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay, ..Self::default() }
    }

    pub fn set(&self, addr: SocketAddr, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(addr, behavior);
    }

    pub fn calls(&self, addr: SocketAddr) -> usize {
        self.calls.lock().unwrap().get(&addr).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

impl Connect for MockConnect {
    fn connect(&self, connector: &Connector) -> Result<Box<dyn Transceiver>, NetError> {
        *self.calls.lock().unwrap().entry(connector.addr()).or_default() += 1;
        std::thread::sleep(self.delay);

        let behavior =
            self.behaviors.lock().unwrap().get(&connector.addr()).cloned().unwrap_or(Behavior::Succeed);
        match behavior {
            Behavior::Succeed => {
                Ok(Box::new(MockTransceiver::new(Duration::ZERO, self.closed.clone())))
            }
            Behavior::Fail(e) => Err(e),
            Behavior::HandshakeFail(e) => {
                Ok(Box::new(MockTransceiver::failing(e, self.closed.clone())))
            }
        }
    }
}

/// Resolver answering from a fixed table; unknown names fail.
#[derive(Debug, Default)]
pub struct MockResolver {
    table: HashMap<String, Vec<IpAddr>>,
    calls: AtomicUsize,
}

impl MockResolver {
    pub fn with(mut self, host: &str, ips: Vec<IpAddr>) -> Self {
        self.table.insert(host.to_string(), ips);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Resolve for MockResolver {
    fn resolve(&self, name: Name) -> Resolving {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.table.get(name.as_str()).cloned().ok_or(NetError::NameNotResolved);
        Box::pin(async move { result })
    }
}

/// Acceptor fed through a channel.
#[derive(Debug)]
pub struct ChannelAcceptor {
    endpoint: Endpoint,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Box<dyn Transceiver>>>,
    pub closed: AtomicUsize,
}

impl ChannelAcceptor {
    pub fn new(endpoint: Endpoint) -> (Arc<Self>, mpsc::UnboundedSender<Box<dyn Transceiver>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let acceptor = Arc::new(Self {
            endpoint,
            incoming: tokio::sync::Mutex::new(rx),
            closed: AtomicUsize::new(0),
        });
        (acceptor, tx)
    }
}

impl Acceptor for ChannelAcceptor {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn accept(&self) -> BoxFuture<'_, Result<Box<dyn Transceiver>, NetError>> {
        Box::pin(async move {
            self.incoming.lock().await.recv().await.ok_or(NetError::ConnectionAborted)
        })
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Polls `condition` until it holds or a second has passed.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
