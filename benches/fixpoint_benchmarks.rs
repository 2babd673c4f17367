//! Fixpoint evaluation benchmarks: cold transitive closure, warm cached
//! re-query, and incremental re-derivation after a single assert.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use stratalog::{Kernel, QueryOptions, Term};

const GRAPH_SCHEMA: &str = "\
Decl edge(X, Y) bound [/number, /number].
Decl path(X, Y) bound [/number, /number].
path(X, Y) :- edge(X, Y).
path(X, Z) :- edge(X, Y), path(Y, Z).
";

fn chain_kernel(n: i64) -> Kernel {
    let kernel = Kernel::new();
    kernel.load_schema(GRAPH_SCHEMA).expect("schema loads");
    for i in 0..n {
        kernel
            .assert_fact("edge", vec![Term::Int(i), Term::Int(i + 1)])
            .expect("assert");
    }
    kernel
}

fn bench_cold_closure(c: &mut Criterion) {
    c.bench_function("closure_cold_chain_100", |b| {
        b.iter_batched(
            || chain_kernel(100),
            |kernel| {
                let result = kernel
                    .query("path(0, Z)", QueryOptions::default())
                    .expect("query");
                black_box(result.len())
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_warm_requery(c: &mut Criterion) {
    let kernel = chain_kernel(100);
    kernel
        .query("path(X, Y)", QueryOptions::default())
        .expect("saturate");
    c.bench_function("closure_warm_requery", |b| {
        b.iter(|| {
            let result = kernel
                .query("path(0, Z)", QueryOptions::default())
                .expect("query");
            black_box(result.len())
        });
    });
}

fn bench_incremental_assert(c: &mut Criterion) {
    c.bench_function("closure_incremental_assert", |b| {
        b.iter_batched(
            || {
                let kernel = chain_kernel(100);
                kernel
                    .query("path(X, Y)", QueryOptions::default())
                    .expect("saturate");
                kernel
            },
            |kernel| {
                kernel
                    .assert_fact("edge", vec![Term::Int(100), Term::Int(101)])
                    .expect("assert");
                let result = kernel
                    .query("path(0, Z)", QueryOptions::default())
                    .expect("query");
                black_box(result.len())
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_negation(c: &mut Criterion) {
    c.bench_function("negation_filter_1000", |b| {
        b.iter_batched(
            || {
                let kernel = Kernel::new();
                kernel
                    .load_schema(
                        "Decl item(X) bound [/number].
                         Decl excluded(X) bound [/number].
                         Decl allowed(X) bound [/number].
                         allowed(X) :- item(X), !excluded(X).",
                    )
                    .expect("load");
                for i in 0..1000 {
                    kernel.assert_fact("item", vec![Term::Int(i)]).expect("assert");
                    if i % 3 == 0 {
                        kernel
                            .assert_fact("excluded", vec![Term::Int(i)])
                            .expect("assert");
                    }
                }
                kernel
            },
            |kernel| {
                let result = kernel
                    .query("allowed(X)", QueryOptions::default())
                    .expect("query");
                black_box(result.len())
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_cold_closure,
    bench_warm_requery,
    bench_incremental_assert,
    bench_negation
);
criterion_main!(benches);
