use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ps2vm_core::{CommandExecutor, EventSink, SyncAction};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn bench_send(c: &mut Criterion) {
    let exec = CommandExecutor::start("bench-send", EventSink::disconnected()).unwrap();

    c.bench_function("send_round_trip", |b| {
        b.iter(|| exec.send("bench", || Ok(black_box(1u32))).unwrap());
    });
}

fn bench_post(c: &mut Criterion) {
    let exec = CommandExecutor::start("bench-post", EventSink::disconnected()).unwrap();
    let counter = Arc::new(AtomicU64::new(0));
    let mut group = c.benchmark_group("post_then_drain");

    for batch in [16u64, 256, 4096] {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                for _ in 0..batch {
                    let counter = counter.clone();
                    exec.post(SyncAction::new("bump", move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }));
                }
                exec.drain().unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_send, bench_post);
criterion_main!(benches);
