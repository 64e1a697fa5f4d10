use core::hint::black_box;
use criterion::{Criterion, criterion_group, criterion_main};
use rpckit_core::{AuthConfig, DevIdentityDefaults};
use rpckit_server::server::{
    admission::AdmissionController,
    chain::{CallContext, CallFuture, Chain, Endpoint},
    layer::GrpcResponse,
    stages::{
        AdmissionStage, AuthStage, ContextTagStage, IdentityTagStage, LoggingStage,
        RecoveryStage, TagStage,
    },
};
use std::sync::Arc;
use tokio::runtime::Builder;
use tonic::{body::Body, metadata::MetadataMap};

fn bench_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");

    let unbounded = AdmissionController::new(0);
    group.bench_function("enter_exit/unbounded", |b| {
        b.iter(|| drop(black_box(unbounded.enter("/bench.Service/Call"))))
    });

    let bounded = AdmissionController::new(1024);
    group.bench_function("enter_exit/bounded", |b| {
        b.iter(|| drop(black_box(bounded.enter("/bench.Service/Call"))))
    });

    let full = AdmissionController::new(1);
    let _held = full.enter("/held");
    group.bench_function("enter/rejected", |b| {
        b.iter(|| black_box(full.enter("/bench.Service/Call")).is_err())
    });

    group.finish();
}

fn endpoint() -> Endpoint<GrpcResponse> {
    Box::new(|_: CallContext| -> CallFuture<'static, GrpcResponse> {
        Box::pin(async { Ok(http::Response::new(Body::empty())) })
    })
}

fn bench_chain(c: &mut Criterion) {
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");

    let auth = AuthConfig {
        disabled: true,
        dev: DevIdentityDefaults {
            tenant: "ACME".into(),
            user: "bench@acme.example.com".into(),
            ..DevIdentityDefaults::default()
        },
    };
    let chain: Chain<GrpcResponse> = Chain::builder()
        .stage(TagStage::new("bench"))
        .stage(ContextTagStage)
        .stage(LoggingStage)
        .stage(AdmissionStage::new(Arc::new(AdmissionController::new(0))))
        .stage(AuthStage::from_config(&auth))
        .stage(IdentityTagStage)
        .stage(RecoveryStage)
        .build();

    let mut group = c.benchmark_group("chain");
    group.bench_function("standard/dev_identity", |b| {
        b.to_async(&runtime).iter(|| async {
            let ctx = CallContext::new("/bench.Service/Call", MetadataMap::new());
            black_box(chain.run(ctx, endpoint()).await)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_admission, bench_chain);
criterion_main!(benches);
