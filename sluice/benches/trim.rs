//! Benchmarks for the retention trim walk.
//!
//! Measures one `trim_stream` call over the in-memory transport for streams
//! where nothing, half, or all of the batch has expired.
//!
//! Run with: `cargo bench -p sluice -- trim`

#![allow(missing_docs)]

use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use sluice::memory::MemoryTransport;
use sluice::message::{Fields, TIMESTAMP_FIELD};
use sluice::retention::{RetentionManager, TRIM_BATCH};
use sluice::transport::StreamTransport;
use tokio::runtime::Runtime;

/// Fills a fresh transport with `TRIM_BATCH` entries stamped 0, 1, 2, ...
fn setup_stream(rt: &Runtime) -> MemoryTransport {
    let transport = MemoryTransport::new();
    rt.block_on(async {
        for i in 0..TRIM_BATCH {
            let mut fields = Fields::new();
            fields.insert(TIMESTAMP_FIELD.to_string(), i.to_string());
            fields.insert("payload".to_string(), "x".repeat(64));
            transport.append("bench", &fields).await.unwrap();
        }
    });
    transport
}

fn bench_trim(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("trim");

    for (label, threshold) in [("none_expired", 0_i64), ("half_expired", 50), ("all_expired", i64::MAX)] {
        group.bench_with_input(BenchmarkId::new("stream", label), &threshold, |b, &threshold| {
            b.iter_batched(
                || setup_stream(&rt),
                |transport| {
                    let manager = RetentionManager::new(transport);
                    rt.block_on(manager.trim_stream("bench", black_box(threshold)))
                        .unwrap()
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_discovery(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let transport = MemoryTransport::new();
    rt.block_on(async {
        for i in 0..500 {
            let mut fields = Fields::new();
            fields.insert(TIMESTAMP_FIELD.to_string(), "0".to_string());
            transport.append(&format!("stream-{i}"), &fields).await.unwrap();
        }
    });
    let manager = RetentionManager::new(transport);

    c.bench_function("discover/500_streams", |b| {
        b.iter(|| rt.block_on(manager.discover_streams()).unwrap());
    });
}

criterion_group!(benches, bench_trim, bench_discovery);
criterion_main!(benches);
