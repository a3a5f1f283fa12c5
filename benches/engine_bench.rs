//! Put / search throughput of the q-gram engine

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use siftdb::{OpenMode, QgramEngine, SearchMode, Tuning};
use tempfile::TempDir;

fn bench_put(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = QgramEngine::new();
    engine.tune(Tuning::default()).unwrap();
    engine
        .open(&dir.path().join("db"), OpenMode::WRITER | OpenMode::CREATE)
        .unwrap();
    let mut id = 0u64;
    c.bench_function("qgram_put_short_text", |b| {
        b.iter(|| {
            id += 1;
            engine
                .put(id, black_box("the quick brown fox jumps over the lazy dog"))
                .unwrap();
        })
    });
    engine.close().unwrap();
}

fn bench_search(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = QgramEngine::new();
    engine
        .open(&dir.path().join("db"), OpenMode::WRITER | OpenMode::CREATE)
        .unwrap();
    for id in 1..=10_000u64 {
        engine
            .put(id, &format!("record {} quick brown fox variant {}", id, id % 97))
            .unwrap();
    }
    engine.sync().unwrap();
    c.bench_function("qgram_search_substring", |b| {
        b.iter(|| {
            let hits = engine
                .search(black_box("brown fox"), SearchMode::Substring)
                .unwrap();
            black_box(hits);
        })
    });
    c.bench_function("qgram_search_expr", |b| {
        b.iter(|| {
            let hits = engine.search_expr(black_box("quick && variant")).unwrap();
            black_box(hits);
        })
    });
    engine.close().unwrap();
}

criterion_group!(benches, bench_put, bench_search);
criterion_main!(benches);
