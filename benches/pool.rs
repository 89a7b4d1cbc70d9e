use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::BoxFuture;
use rpcnet::base::neterror::NetError;
use rpcnet::dns::{Name, Resolve, Resolving};
use rpcnet::pool::ConnectionPool;
use rpcnet::transport::{Connect, Connector, Endpoint, Protocol, Transceiver};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

#[derive(Debug)]
struct LoopbackResolver;

impl Resolve for LoopbackResolver {
    fn resolve(&self, _name: Name) -> Resolving {
        Box::pin(async { Ok(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]) })
    }
}

#[derive(Debug)]
struct NullTransceiver;

impl Transceiver for NullTransceiver {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn initialize(&mut self) -> BoxFuture<'_, Result<(), NetError>> {
        Box::pin(async { Ok(()) })
    }

    fn write<'a>(&'a mut self, _buf: &'a [u8]) -> BoxFuture<'a, Result<(), NetError>> {
        Box::pin(async { Ok(()) })
    }

    fn close(self: Box<Self>) {}
}

#[derive(Debug)]
struct NullConnect;

impl Connect for NullConnect {
    fn connect(&self, _connector: &Connector) -> Result<Box<dyn Transceiver>, NetError> {
        Ok(Box::new(NullTransceiver))
    }
}

/// Lookups served from the live-connection indexes, no I/O involved.
fn benchmark_pool_lookups(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let pool = rt.block_on(async {
        let pool = ConnectionPool::builder()
            .resolver(Arc::new(LoopbackResolver))
            .connector(Arc::new(NullConnect))
            .build()
            .unwrap();
        for port in 1..=64 {
            pool.create(vec![Endpoint::tcp("svc.internal", port)], false).await.unwrap();
        }
        pool
    });

    let endpoint = Endpoint::tcp("svc.internal", 32);
    c.bench_function("pool_endpoint_hit", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(pool.create(vec![endpoint.clone()], false).await.unwrap());
        })
    });

    // Misses the endpoint index, hits the connector index after resolution.
    let alias = Endpoint::tcp("alias.internal", 32);
    c.bench_function("pool_connector_hit", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(pool.create(vec![alias.clone()], false).await.unwrap());
        })
    });

    c.bench_function("endpoint_parse", |b| {
        b.iter(|| black_box("tcp://svc.internal:4061?compress=1&timeout=500".parse::<Endpoint>()))
    });
}

criterion_group!(benches, benchmark_pool_lookups);
criterion_main!(benches);
