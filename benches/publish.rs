//! Performance benchmarks for trading-bus
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use trading_bus::transport::memory::MemoryTransport;
use trading_bus::{BusConfig, MessageBus, MessageSigner, Schema, StreamRegistry};

fn price() -> serde_json::Value {
    serde_json::json!({"ticker": "SOL", "price": 150_000_000u64, "confidence": 25_000u64})
}

fn bench_validation(c: &mut Criterion) {
    let registry = StreamRegistry::trading();
    let binding = registry.resolve("price.update").unwrap();
    let payload = price();

    c.bench_function("validate price.update", |b| {
        b.iter(|| binding.schema.validate(&payload).unwrap());
    });

    let order = serde_json::json!({
        "orderId": "o-1",
        "wallet": "wallet-1",
        "ticker": "SOL",
        "side": "buy",
        "orderType": "limit",
        "size": 10,
        "limitPrice": 149_000_000u64
    });
    let binding = registry.resolve("order.request").unwrap();
    c.bench_function("validate order.request", |b| {
        b.iter(|| binding.schema.validate(&order).unwrap());
    });
}

fn bench_signing(c: &mut Criterion) {
    let signer = MessageSigner::new("bench-key").unwrap();
    let payload = price();
    let now = chrono::Utc::now();
    let signature = signer.sign("price:update", now, &payload).unwrap();

    c.bench_function("sign", |b| {
        b.iter(|| signer.sign("price:update", now, &payload).unwrap());
    });

    c.bench_function("verify", |b| {
        b.iter(|| {
            signer
                .verify("price:update", now, &payload, Some(&signature))
                .unwrap()
        });
    });
}

fn bench_memory_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let (plain, signed) = rt.block_on(async {
        let registry = Arc::new(StreamRegistry::trading());
        let plain = MessageBus::new(
            BusConfig::new("memory://bench"),
            registry.clone(),
            Arc::new(MemoryTransport::default()),
        )
        .await
        .unwrap();
        let signed = MessageBus::new(
            BusConfig::new("memory://bench").with_signing_key("bench-key"),
            registry,
            Arc::new(MemoryTransport::default()),
        )
        .await
        .unwrap();
        (plain, signed)
    });
    let payload = price();

    c.bench_function("MemoryTransport publish", |b| {
        b.to_async(&rt)
            .iter(|| async { plain.publish("price.update", &payload).await.unwrap() });
    });

    c.bench_function("MemoryTransport publish (signed)", |b| {
        b.to_async(&rt)
            .iter(|| async { signed.publish("price.update", &payload).await.unwrap() });
    });
}

criterion_group!(benches, bench_validation, bench_signing, bench_memory_publish);
criterion_main!(benches);
