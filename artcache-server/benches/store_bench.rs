use artcache_protocol::{Artifact, ArtifactFile, ArtifactKey, HashedArtifact};
use artcache_server::ArtifactStore;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

fn artifact(size: usize) -> HashedArtifact {
    HashedArtifact::seal(
        Artifact::new(vec![
            ArtifactFile::new("lib/libbench.a", vec![0xA5u8; size]),
            ArtifactFile::new("include/bench.h", b"#pragma once\n".to_vec()),
        ])
        .unwrap(),
    )
}

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");
    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let store = ArtifactStore::in_memory(1 << 30, 1 << 29);
        let artifact = artifact(size);
        let key = ArtifactKey::new("linux_amd64", "bench/lib/00").unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| store.store(black_box(&key), black_box(&artifact)).unwrap());
        });
    }
    group.finish();
}

fn bench_fetch(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch");
    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let store = ArtifactStore::in_memory(1 << 30, 1 << 29);
        let key = ArtifactKey::new("linux_amd64", "bench/lib/00").unwrap();
        store.store(&key, &artifact(size)).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| store.fetch(black_box(&key)).unwrap().unwrap());
        });
    }
    group.finish();
}

fn bench_eviction(c: &mut Criterion) {
    // Every store pushes the oldest entry out
    let store = ArtifactStore::in_memory(64 * 1024, 48 * 1024);
    let artifact = artifact(16 * 1024);
    let mut n = 0u64;

    c.bench_function("store_with_eviction", |b| {
        b.iter(|| {
            n += 1;
            let key = ArtifactKey::new("linux_amd64", format!("bench/lib/{n}")).unwrap();
            store.store(&key, black_box(&artifact)).unwrap();
        });
    });
}

criterion_group!(benches, bench_store, bench_fetch, bench_eviction);
criterion_main!(benches);
