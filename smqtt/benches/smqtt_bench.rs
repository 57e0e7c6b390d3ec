//! Broker round-trip benchmarks.
//!
//! Run with: cargo bench -p smqtt --bench smqtt_bench

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use smqtt::{Broker, BrokerConfig, Client, ClientConfig};

/// Start a broker on an ephemeral port and return the port.
fn start_broker(rt: &tokio::runtime::Runtime) -> u16 {
    rt.block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = Broker::new(BrokerConfig::new("127.0.0.1", port).with_outbound_queue(10_000));
        tokio::spawn(async move {
            let _ = broker.serve_listener(listener).await;
        });
        port
    })
}

fn connect(rt: &tokio::runtime::Runtime, port: u16, client_id: &str) -> Client {
    rt.block_on(async {
        Client::connect(ClientConfig::new("127.0.0.1", port, client_id))
            .await
            .unwrap()
    })
}

/// Client publish throughput (QoS 0, no subscribers).
fn bench_publish_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let port = start_broker(&rt);
    let client = Arc::new(Mutex::new(connect(&rt, port, "bench-client")));

    let mut group = c.benchmark_group("publish_throughput");

    for size in [64usize, 256, 1024, 4096] {
        let payload = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.to_async(&rt).iter(|| {
                let client = Arc::clone(&client);
                let payload = payload.clone();
                async move {
                    client.lock().await.publish("bench/topic", payload).await.unwrap();
                }
            });
        });
    }

    group.finish();
}

/// Publish to receive latency through the broker.
fn bench_e2e_latency(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let port = start_broker(&rt);

    let publisher = Arc::new(Mutex::new(connect(&rt, port, "bench-pub")));
    let mut subscriber = connect(&rt, port, "bench-sub");
    rt.block_on(subscriber.subscribe("bench/latency")).unwrap();
    let subscriber = Arc::new(Mutex::new(subscriber));

    c.bench_function("e2e_latency_64b", |b| {
        b.to_async(&rt).iter(|| {
            let publisher = Arc::clone(&publisher);
            let subscriber = Arc::clone(&subscriber);
            async move {
                publisher.lock().await.publish("bench/latency", vec![0u8; 64]).await.unwrap();
                subscriber
                    .lock()
                    .await
                    .recv_timeout(Duration::from_secs(1))
                    .await
                    .unwrap();
            }
        });
    });
}

criterion_group!(benches, bench_publish_throughput, bench_e2e_latency);
criterion_main!(benches);
