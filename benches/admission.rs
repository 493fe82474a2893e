use criterion::{black_box, criterion_group, criterion_main, Criterion};
use floodgate::{
    AdmissionLayer, AdmissionPipeline, Algorithm, BucketConfig, GlobalConfig, InMemoryStore,
    RoutePolicy, RouteTable, SuspensionConfig,
};

use futures::future::Ready;
use http::{Request, Response};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tower::{Layer, Service};

// Handler that answers immediately, so only the middleware is measured.
#[derive(Clone)]
struct OkService;

impl Service<Request<()>> for OkService {
    type Response = Response<()>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<()>) -> Self::Future {
        futures::future::ready(Ok(Response::new(())))
    }
}

fn pipeline(algorithm: Algorithm) -> AdmissionPipeline {
    let config = GlobalConfig {
        algorithm,
        default_max_requests: Some(u32::MAX),
        bucket: BucketConfig { capacity: i64::MAX, drip_rate: 0, ..BucketConfig::default() },
        suspension: SuspensionConfig { threshold: i64::MAX, ..SuspensionConfig::default() },
        ..GlobalConfig::default()
    };
    AdmissionPipeline::builder(Arc::new(InMemoryStore::new()))
        .config(config)
        .routes(RouteTable::new().route("/bench", Some(RoutePolicy::new())))
        .build()
        .unwrap()
}

fn decide_per_algorithm(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    for algorithm in [Algorithm::FixedWindow, Algorithm::TokenBucket, Algorithm::LeakyBucket] {
        let p = pipeline(algorithm);
        c.bench_function(&format!("decide_{}", algorithm.as_str()), |b| {
            b.to_async(&rt).iter(|| async {
                black_box(p.decide_route(black_box("198.51.100.1"), "/bench").await);
            });
        });
    }
}

fn decide_many_clients(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let p = pipeline(Algorithm::TokenBucket);
    let next = AtomicU64::new(0);

    c.bench_function("decide_token_bucket_distinct_clients", |b| {
        b.to_async(&rt).iter(|| async {
            let client = format!("client-{}", next.fetch_add(1, Ordering::Relaxed) % 10_000);
            black_box(p.decide_route(&client, "/bench").await);
        });
    });
}

fn middleware_overhead(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let svc = AdmissionLayer::new(pipeline(Algorithm::FixedWindow)).layer(OkService);

    c.bench_function("admission_layer_admit", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let req = Request::builder()
                .uri("/bench")
                .header("x-forwarded-for", "198.51.100.2")
                .body(())
                .unwrap();
            let _ = black_box(local_svc.call(req).await);
        });
    });
}

criterion_group!(benches, decide_per_algorithm, decide_many_clients, middleware_overhead);
criterion_main!(benches);
