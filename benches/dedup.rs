//! Deduplication hot-path benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use uniqued::bus::Body;
use uniqued::sealed::{digest_fd, SealedMemfd};
use uniqued::Service;

fn bench_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest_fd");

    for size in [4 * 1024, 64 * 1024, 1024 * 1024] {
        let data = vec![0x5au8; size];
        let memfd = SealedMemfd::for_bytes(&data).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &memfd, |b, memfd| {
            b.iter(|| digest_fd(memfd).unwrap());
        });
    }

    group.finish();
}

fn bench_make_unique_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("make_unique");

    let data = vec![0xa7u8; 64 * 1024];
    let mut service = Service::new();

    // Seed the canonical blob so every benched submission is a hit.
    let seed = SealedMemfd::for_bytes(&data).unwrap();
    service
        .dispatch(":1.0", "MakeUnique", &Body::fd_index(0), vec![seed.into_fd()])
        .unwrap();

    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("hit_64k", |b| {
        b.iter_batched(
            || SealedMemfd::for_bytes(&data).unwrap().into_fd(),
            |fd| {
                let (body, _fds) = service
                    .dispatch(":1.1", "MakeUnique", &Body::fd_index(0), vec![fd])
                    .unwrap();
                let (_, handle) = body.as_fds_and_handle().unwrap();
                service
                    .dispatch(":1.1", "Forget", &Body::handle(handle), Vec::new())
                    .unwrap();
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_digest, bench_make_unique_hit);
criterion_main!(benches);
