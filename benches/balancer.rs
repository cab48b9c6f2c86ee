use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tollgate::{
    AdmissionRequest, BrokerConfig, BucketShape, InMemoryCatalog, InMemoryStore, Jitter,
    RateLimitLayer, ResourceBroker, ResourceMeta, ResourceStatus, Tier, TokenBucket,
    WeightedBalancer,
};

use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::{service_fn, ServiceBuilder, ServiceExt};

fn balancer_next(c: &mut Criterion) {
    let balancer = WeightedBalancer::with_nodes((1..=32).map(|id| (id, id * 10)));

    c.bench_function("balancer_next_32_nodes", |b| {
        b.iter(|| black_box(balancer.next()));
    });
}

fn rate_limit_layer_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let shape = BucketShape::per_second(u32::MAX as u64).unwrap();
    let layer = RateLimitLayer::new(TokenBucket::new(store, "bench"), "echo", shape);
    let guarded = ServiceBuilder::new()
        .layer(layer)
        .service(service_fn(|n: u64| async move { Ok::<_, Infallible>(n + 1) }));

    c.bench_function("rate_limit_layer_allowed", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(guarded.clone().oneshot(black_box(41)).await).ok();
        });
    });
}

fn broker_admit_fast_path(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let catalog = Arc::new(InMemoryCatalog::new());
    for id in 1..=8 {
        catalog.insert(ResourceMeta {
            id,
            capabilities: vec!["geocode".into()],
            tier: Tier::Shared,
            status: ResourceStatus::Active,
            daily_limit: u32::MAX as u64,
            per_second_limit: u32::MAX as u64,
            credential: format!("key-{id}"),
        });
    }
    let broker = ResourceBroker::new(store, catalog, BrokerConfig::default())
        .with_jitter(Jitter::None);
    let request = AdmissionRequest::new("geocode", Tier::Shared);
    let cancel = CancellationToken::new();

    c.bench_function("broker_admit_warm_pool", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(broker.admit(&request, &cancel).await);
        });
    });
}

criterion_group!(benches, balancer_next, rate_limit_layer_throughput, broker_admit_fast_path);
criterion_main!(benches);
