//! Connection pool integration tests.
//!
//! Covers:
//! - Connect deduplication across concurrent requests
//! - Lookup by either compression variant and by connector
//! - Connector fallback and the timeout stop rule
//! - destroy() / wait_until_finished()
//! - Index cleanup on connection closure

mod common;

use common::{addr, ip, Behavior, MockConnect, MockResolver};
use futures::future::join_all;
use rpcnet::base::neterror::NetError;
use rpcnet::config::PoolConfig;
use rpcnet::connection::{Adapter, ConnectionState};
use rpcnet::pool::ConnectionPool;
use rpcnet::transport::Endpoint;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const PORT: u16 = 4061;

fn pool_with(resolver: MockResolver, connect: &Arc<MockConnect>, config: PoolConfig) -> ConnectionPool {
    ConnectionPool::builder()
        .config(config)
        .resolver(Arc::new(resolver))
        .connector(connect.clone())
        .build()
        .unwrap()
}

fn svc() -> Endpoint {
    Endpoint::tcp("svc.internal", PORT)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_share_one_connect() {
    let connect = Arc::new(MockConnect::with_delay(Duration::from_millis(50)));
    let resolver = MockResolver::default().with("svc.internal", vec![ip(1), ip(2)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());

    let results = join_all((0..8).map(|_| {
        let pool = pool.clone();
        tokio::spawn(async move { pool.create(vec![svc()], false).await })
    }))
    .await;

    let ids: Vec<u64> = results.into_iter().map(|r| r.unwrap().unwrap().0.id()).collect();
    assert!(ids.iter().all(|id| *id == ids[0]), "all callers share one connection");
    assert_eq!(connect.calls(addr(1, PORT)), 1);
    assert_eq!(connect.calls(addr(2, PORT)), 0);
    assert_eq!(pool.connections().len(), 1);
}

#[tokio::test]
async fn test_lookup_by_compression_variant_and_connector() {
    let connect = Arc::new(MockConnect::default());
    let resolver = MockResolver::default()
        .with("svc.internal", vec![ip(1)])
        .with("alias.internal", vec![ip(1)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());

    let (first, compress) = pool.create(vec![svc()], false).await.unwrap();
    assert!(!compress);
    assert_eq!(first.state(), ConnectionState::Active);

    // Same endpoint with compression on: served from the endpoint index.
    let (second, compress) = pool.create(vec![svc().with_compress(true)], false).await.unwrap();
    assert_eq!(second.id(), first.id());
    assert!(compress);

    // A different host resolving to the same address: served by connector.
    let alias = Endpoint::tcp("alias.internal", PORT).with_compress(true);
    let (third, compress) = pool.create(vec![alias], false).await.unwrap();
    assert_eq!(third.id(), first.id());
    assert!(compress);

    assert_eq!(connect.total_calls(), 1);
}

#[tokio::test]
async fn test_override_compress_and_timeout() {
    let connect = Arc::new(MockConnect::default());
    let resolver = MockResolver::default().with("svc.internal", vec![ip(1)]);
    let config = PoolConfig::default()
        .override_compress(true)
        .override_timeout(Duration::from_millis(750));
    let pool = pool_with(resolver, &connect, config);

    let endpoint = svc().with_timeout(Some(Duration::from_secs(5)));
    let (connection, compress) = pool.create(vec![endpoint.clone()], false).await.unwrap();
    assert!(compress);
    assert_eq!(connection.endpoint().timeout(), None);

    let (again, compress) = pool.create(vec![endpoint], false).await.unwrap();
    assert_eq!(again.id(), connection.id());
    assert!(compress);
}

#[tokio::test]
async fn test_connect_timeout_stops_fallback() {
    let connect = Arc::new(MockConnect::default());
    connect.set(addr(1, PORT), Behavior::Fail(NetError::ConnectTimeout));
    let resolver = MockResolver::default().with("svc.internal", vec![ip(1), ip(2), ip(3)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());

    let result = pool.create(vec![svc()], false).await;
    assert!(matches!(result, Err(NetError::ConnectTimeout)));
    assert_eq!(connect.calls(addr(1, PORT)), 1);
    assert_eq!(connect.calls(addr(2, PORT)), 0);
    assert_eq!(connect.calls(addr(3, PORT)), 0);
}

#[tokio::test]
async fn test_generic_failure_falls_back() {
    let connect = Arc::new(MockConnect::default());
    connect.set(addr(1, PORT), Behavior::Fail(NetError::ConnectionRefused));
    connect.set(addr(2, PORT), Behavior::HandshakeFail(NetError::HandshakeFailed("bad".into())));
    let resolver = MockResolver::default().with("svc.internal", vec![ip(1), ip(2), ip(3)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());

    let (connection, _) = pool.create(vec![svc()], false).await.unwrap();
    assert_eq!(connection.connector().unwrap().addr(), addr(3, PORT));
    assert_eq!(connect.total_calls(), 3);

    // The failed handshake closed its transceiver and left the index.
    assert_eq!(connect.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.connections().len(), 1);
}

#[tokio::test]
async fn test_all_connectors_fail_surfaces_last_error() {
    let connect = Arc::new(MockConnect::default());
    connect.set(addr(1, PORT), Behavior::Fail(NetError::ConnectionRefused));
    connect.set(addr(2, PORT), Behavior::Fail(NetError::ConnectionAborted));
    let resolver = MockResolver::default().with("svc.internal", vec![ip(1), ip(2)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());

    let result = pool.create(vec![svc()], true).await;
    assert!(matches!(result, Err(NetError::ConnectionAborted)));

    pool.wait_until_finished().await;
    assert_eq!(pool.pending_connect_count(), 0);
}

#[tokio::test]
async fn test_endpoint_resolution_fallback() {
    let connect = Arc::new(MockConnect::default());
    let resolver = MockResolver::default().with("backup.internal", vec![ip(9)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());

    let endpoints = vec![Endpoint::tcp("missing.internal", PORT), Endpoint::tcp("backup.internal", PORT)];
    let (connection, _) = pool.create(endpoints, false).await.unwrap();
    assert_eq!(connection.connector().unwrap().addr(), addr(9, PORT));
    assert_eq!(connection.endpoint().host(), "backup.internal");

    let result = pool.create(vec![Endpoint::tcp("missing.internal", PORT)], false).await;
    assert!(matches!(result, Err(NetError::NameNotResolved)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_callers_first_connector_fails() {
    let connect = Arc::new(MockConnect::with_delay(Duration::from_millis(50)));
    connect.set(addr(1, PORT), Behavior::Fail(NetError::ConnectionRefused));
    let resolver = MockResolver::default().with("svc.internal", vec![ip(1), ip(2)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());

    let (a, b) = tokio::join!(pool.create(vec![svc()], false), pool.create(vec![svc()], false));
    let (a, b) = (a.unwrap().0, b.unwrap().0);

    assert_eq!(a.id(), b.id());
    assert_eq!(a.connector().unwrap().addr(), addr(2, PORT));
    assert_eq!(connect.calls(addr(1, PORT)), 1);
    assert_eq!(connect.calls(addr(2, PORT)), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_destroy_fails_pending_requests() {
    let connect = Arc::new(MockConnect::with_delay(Duration::from_millis(200)));
    let resolver = MockResolver::default().with("svc.internal", vec![ip(1)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());

    let pending: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.create(vec![svc()], false).await })
        })
        .collect();

    assert!(common::eventually(|| connect.total_calls() == 1).await);
    pool.destroy();
    pool.wait_until_finished().await;

    assert_eq!(pool.pending_connect_count(), 0);
    for handle in pending {
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(NetError::PoolDestroyed)));
    }

    // The transceiver that arrived after destroy was closed, never pooled.
    assert_eq!(connect.closed.load(Ordering::SeqCst), 1);
    assert!(pool.connections().is_empty());
    assert!(matches!(pool.create(vec![svc()], false).await, Err(NetError::PoolDestroyed)));
}

#[tokio::test]
async fn test_destroy_closes_live_connections() {
    let connect = Arc::new(MockConnect::default());
    let resolver = MockResolver::default().with("svc.internal", vec![ip(1)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());

    let (connection, _) = pool.create(vec![svc()], false).await.unwrap();
    pool.destroy();
    pool.wait_until_finished().await;

    assert_eq!(connection.state(), ConnectionState::Finished);
    assert!(matches!(connection.close_reason(), NetError::PoolDestroyed));
    assert!(pool.is_destroyed());
}

#[tokio::test]
async fn test_closed_connection_leaves_no_residue() {
    let connect = Arc::new(MockConnect::default());
    let resolver = MockResolver::default().with("svc.internal", vec![ip(1)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());

    let (first, _) = pool.create(vec![svc()], false).await.unwrap();
    first.destroy(NetError::ConnectionClosed);
    assert!(pool.connections().is_empty());
    assert!(format!("{:?}", pool).contains("connections: 0"));

    // Neither index serves the closed connection any more.
    let (second, _) = pool.create(vec![svc().with_compress(true)], false).await.unwrap();
    assert_ne!(second.id(), first.id());
    assert_eq!(connect.total_calls(), 2);
}

#[derive(Debug)]
struct NamedAdapter(&'static str);

impl Adapter for NamedAdapter {
    fn name(&self) -> &str {
        self.0
    }
}

#[tokio::test]
async fn test_default_adapter_and_removal() {
    let connect = Arc::new(MockConnect::default());
    let resolver = MockResolver::default().with("svc.internal", vec![ip(1)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());

    let adapter: Arc<dyn Adapter> = Arc::new(NamedAdapter("callbacks"));
    pool.set_default_adapter(Some(adapter.clone()));

    let (connection, _) = pool.create(vec![svc()], false).await.unwrap();
    assert_eq!(connection.adapter().unwrap().name(), "callbacks");

    pool.remove_adapter(&adapter);
    assert!(connection.adapter().is_none());
}

#[tokio::test]
async fn test_flush_batch_requests() {
    let connect = Arc::new(MockConnect::default());
    let resolver = MockResolver::default().with("svc.internal", vec![ip(1)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());

    let (connection, _) = pool.create(vec![svc()], false).await.unwrap();
    connection.queue_batch_request(bytes::Bytes::from_static(b"ping")).unwrap();
    assert_eq!(connection.batch_request_count(), 1);

    pool.flush_batch_requests().await;
    assert_eq!(connection.batch_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_is_connect_timeout() {
    #[derive(Debug)]
    struct SlowHandshake;

    impl rpcnet::transport::Connect for SlowHandshake {
        fn connect(
            &self,
            _connector: &rpcnet::transport::Connector,
        ) -> Result<Box<dyn rpcnet::transport::Transceiver>, NetError> {
            Ok(Box::new(common::MockTransceiver::new(Duration::from_secs(60), Default::default())))
        }
    }

    let resolver = MockResolver::default().with("svc.internal", vec![ip(1), ip(2)]);
    let pool = ConnectionPool::builder()
        .config(PoolConfig::default().handshake_timeout(Some(Duration::from_secs(1))))
        .resolver(Arc::new(resolver))
        .connector(Arc::new(SlowHandshake))
        .build()
        .unwrap();

    let result = pool.create(vec![svc()], false).await;
    assert!(matches!(result, Err(NetError::ConnectTimeout)));
}

#[tokio::test]
async fn test_shared_connector_attempted_once_per_request() {
    let connect = Arc::new(MockConnect::default());
    connect.set(addr(1, PORT), Behavior::Fail(NetError::ConnectionRefused));
    let resolver = MockResolver::default()
        .with("svc.internal", vec![ip(1)])
        .with("alias.internal", vec![ip(1)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());

    let endpoints =
        vec![svc(), svc().with_compress(true), Endpoint::tcp("alias.internal", PORT)];
    let result = pool.create(endpoints, false).await;
    assert!(matches!(result, Err(NetError::ConnectionRefused)));
    assert_eq!(connect.calls(addr(1, PORT)), 1);
}

#[tokio::test]
async fn test_first_endpoint_decides_compression_for_shared_connector() {
    let connect = Arc::new(MockConnect::default());
    let resolver = MockResolver::default().with("svc.internal", vec![ip(1)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());

    let (connection, compress) =
        pool.create(vec![svc().with_compress(true), svc()], false).await.unwrap();
    assert!(compress);
    assert!(connection.endpoint().compress());
    assert_eq!(connect.total_calls(), 1);
}

#[tokio::test]
async fn test_wait_before_destroy_keeps_new_connections() {
    let connect = Arc::new(MockConnect::default());
    let resolver = MockResolver::default()
        .with("svc.internal", vec![ip(1)])
        .with("other.internal", vec![ip(2)]);
    let pool = pool_with(resolver, &connect, PoolConfig::default());
    let other = Endpoint::tcp("other.internal", PORT);

    let (first, _) = pool.create(vec![svc()], false).await.unwrap();
    let waiting = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.wait_until_finished().await })
    };
    // Let the waiter take its snapshot of the live connections.
    tokio::task::yield_now().await;

    let (second, _) = pool.create(vec![other.clone()], false).await.unwrap();
    first.destroy(NetError::ConnectionClosed);
    waiting.await.unwrap();

    assert_eq!(pool.connections().len(), 1);
    let (again, _) = pool.create(vec![other], false).await.unwrap();
    assert_eq!(again.id(), second.id());
    assert_eq!(connect.total_calls(), 2);
}
