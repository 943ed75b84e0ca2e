//! Criterion benchmarks for hybrid-memory.
//!
//! Covers the HNSW graph, the structured store and end-to-end hybrid queries
//! through the coordinator.

use std::hint::black_box;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use hybrid_memory::coordinator::{HybridCoordinator, HybridMemoryConfig};
use hybrid_memory::entry::{MemoryEntry, StoreRequest, entry_id};
use hybrid_memory::namespace::NamespaceScope;
use hybrid_memory::query::{
    CombineStrategy, HybridQuery, QueryOptions, SemanticQuery, StructuredFilter,
};
use hybrid_memory::semantic::{DistanceMetric, HnswGraph, HnswParams, Vector};
use hybrid_memory::structured::StructuredStore;
use tokio::runtime::Runtime;

/// Generate test vectors for benchmarking.
fn generate_test_vectors(count: usize, dimension: usize) -> Vec<Vector> {
    let mut vectors = Vec::with_capacity(count);

    for i in 0..count {
        let mut data = Vec::with_capacity(dimension);
        for j in 0..dimension {
            let value = ((i as f32 * 0.1 + j as f32 * 0.01).sin() * 0.5 + 0.5) * 2.0 - 1.0;
            data.push(value);
        }
        vectors.push(Vector::new(data));
    }

    vectors
}

/// Benchmark HNSW graph construction and search.
fn bench_vector_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_search");
    group.sample_size(20);

    let dimension = 128;
    let vectors = generate_test_vectors(1000, dimension);
    let ids: Vec<_> = (0..vectors.len())
        .map(|i| entry_id("bench", &format!("v{i}")))
        .collect();

    group.throughput(Throughput::Elements(200));
    group.bench_function("hnsw_insert_200", |b| {
        b.iter_with_setup(
            || HnswGraph::new(HnswParams::default()),
            |graph| {
                for (id, vector) in ids.iter().zip(&vectors).take(200) {
                    graph.insert(*id, vector.clone());
                }
                black_box(graph);
            },
        )
    });

    let graph = HnswGraph::new(HnswParams::default());
    for (id, vector) in ids.iter().zip(&vectors) {
        graph.insert(*id, vector.clone());
    }
    let query = &vectors[500];

    group.throughput(Throughput::Elements(1));
    group.bench_function("hnsw_search_k10", |b| {
        b.iter(|| black_box(graph.search(black_box(&query.data), 10, None)))
    });

    group.bench_function("hnsw_search_k10_wide_beam", |b| {
        b.iter(|| black_box(graph.search(black_box(&query.data), 10, Some(200))))
    });

    group.bench_function("cosine_similarity_batch_100", |b| {
        let targets: Vec<&[f32]> = vectors[1..101].iter().map(|v| v.data.as_slice()).collect();
        b.iter(|| {
            black_box(
                DistanceMetric::Cosine
                    .batch_similarity_parallel(black_box(&query.data), &targets)
                    .unwrap(),
            )
        })
    });

    group.finish();
}

/// Benchmark the structured store.
fn bench_structured_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("structured_store");

    group.throughput(Throughput::Elements(100));
    group.bench_function("store_100", |b| {
        b.iter_with_setup(
            || StructuredStore::in_memory().unwrap(),
            |store| {
                for i in 0..100 {
                    let entry = MemoryEntry::new("bench", format!("key-{i}"), "payload")
                        .with_tag(if i % 2 == 0 { "even" } else { "odd" });
                    store.store(entry).unwrap();
                }
                black_box(store);
            },
        )
    });

    let store = StructuredStore::in_memory().unwrap();
    for i in 0..2000 {
        let entry = MemoryEntry::new("bench", format!("key-{i:05}"), "payload")
            .with_tag(if i % 2 == 0 { "even" } else { "odd" });
        store.store(entry).unwrap();
    }
    let scope = NamespaceScope::Single("bench".to_string());

    group.throughput(Throughput::Elements(1));
    group.bench_function("get_by_key", |b| {
        b.iter(|| black_box(store.get_by_key("bench", black_box("key-01000")).unwrap()))
    });

    group.bench_function("query_tag_prefix", |b| {
        let filter = StructuredFilter::new()
            .with_tag("even")
            .with_key_prefix("key-01")
            .with_limit(50);
        b.iter(|| black_box(store.query(black_box(&filter), &scope).unwrap()))
    });

    group.finish();
}

/// Benchmark hybrid queries through the coordinator.
fn bench_hybrid_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("hybrid_queries");
    group.sample_size(30);

    let runtime = Runtime::new().unwrap();
    let dimension = 64;
    let vectors = generate_test_vectors(1000, dimension);

    let memory = runtime.block_on(async {
        let memory = HybridCoordinator::open(HybridMemoryConfig::default(), None)
            .await
            .unwrap();
        for (i, vector) in vectors.iter().enumerate() {
            memory
                .store(
                    StoreRequest::new(format!("doc-{i:04}"), format!("document {i}"))
                        .with_vector(vector.clone())
                        .with_tag(if i % 10 == 0 { "rare" } else { "common" }),
                )
                .await
                .unwrap();
        }
        memory
    });

    // Distinct vectors per iteration keep the result cache out of the picture.
    let mut next = 0usize;
    let mut query_vector = || {
        next = (next + 1) % vectors.len();
        vectors[next].clone()
    };

    for strategy in [
        CombineStrategy::Union,
        CombineStrategy::Intersection,
        CombineStrategy::SemanticFirst,
        CombineStrategy::StructuredFirst,
    ] {
        group.bench_function(format!("{strategy:?}").to_lowercase(), |b| {
            b.iter(|| {
                let query = HybridQuery::new(
                    StructuredFilter::new().with_tag("rare"),
                    SemanticQuery::vector(query_vector(), 10),
                    strategy,
                )
                .with_limit(10);
                runtime.block_on(async {
                    black_box(
                        memory
                            .query_hybrid(&query, QueryOptions::default())
                            .await
                            .unwrap(),
                    )
                })
            })
        });
    }

    group.bench_function("store_with_vector", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % 1000;
            let request = StoreRequest::new(format!("new-{i}"), "fresh")
                .with_namespace("writes")
                .with_vector(query_vector());
            runtime.block_on(async { black_box(memory.store(request).await.unwrap()) })
        })
    });

    runtime.block_on(async { memory.close().await.unwrap() });
    group.finish();
}

criterion_group!(
    benches,
    bench_vector_search,
    bench_structured_store,
    bench_hybrid_queries
);

criterion_main!(benches);
