//! Query-path benchmarks
//!
//! Run with: cargo bench --bench search

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use emblem_core::{
    dot_product, l2_distance_squared, AnnIndex, BuildConfig, IndexBuilder, QueryLimits,
    VectorStore,
};

fn random_vector(dim: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect()
}

fn build_index(count: usize, dim: usize) -> (TempDir, AnnIndex) {
    let dir = tempfile::tempdir().unwrap();
    let mut store = VectorStore::open(dir.path().join("bank.evb")).unwrap();

    let mut rng = StdRng::seed_from_u64(404);
    let ids: Vec<u64> = (1..=count as u64).collect();
    let vectors: Vec<Vec<f32>> = ids.iter().map(|_| random_vector(dim, &mut rng)).collect();
    store.append_batch(&ids, &vectors).unwrap();

    let builder = IndexBuilder::new(BuildConfig {
        index_dir: dir.path().join("indexes"),
        tmp_dir: dir.path().join("tmp"),
        tree_count: 10,
        leaf_size: 16,
        seed: Some(1),
    });
    let artifacts = builder.build(&store.snapshot(), 1).unwrap();
    let index = AnnIndex::load_dir(&artifacts.dir, QueryLimits::default()).unwrap();
    (dir, index)
}

fn bench_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("kernels");
    let mut rng = StdRng::seed_from_u64(2);

    for dim in [64, 256, 512] {
        group.throughput(Throughput::Elements(dim as u64));
        let a = random_vector(dim, &mut rng);
        let b = random_vector(dim, &mut rng);

        group.bench_function(format!("dot_dim_{dim}"), |bencher| {
            bencher.iter(|| dot_product(black_box(&a), black_box(&b)))
        });
        group.bench_function(format!("l2sq_dim_{dim}"), |bencher| {
            bencher.iter(|| l2_distance_squared(black_box(&a), black_box(&b)))
        });
    }

    group.finish();
}

fn bench_query_by_vector(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_by_vector");
    let mut rng = StdRng::seed_from_u64(3);

    for count in [1_000, 10_000] {
        let dim = 128;
        let (_dir, index) = build_index(count, dim);
        let query = random_vector(dim, &mut rng);

        group.bench_function(format!("n_{count}_k10"), |bencher| {
            bencher.iter(|| index.query_by_vector(black_box(&query), 10).unwrap())
        });
    }

    group.finish();
}

fn bench_query_by_key(c: &mut Criterion) {
    let (_dir, index) = build_index(10_000, 128);

    c.bench_function("query_by_key_n_10000_k10", |bencher| {
        bencher.iter(|| index.query_by_key(black_box(5000), 10).unwrap())
    });
}

criterion_group!(
    benches,
    bench_kernels,
    bench_query_by_vector,
    bench_query_by_key
);
criterion_main!(benches);
