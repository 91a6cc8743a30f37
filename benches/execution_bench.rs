use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tessera::ast::{build::*, Intrinsic, Module};
use tessera::{invoke_parallel, load, EngineOptions, ExecutionPolicy, FunctionId, Invocation, ParallelConfig, Type, TypedValue};

fn sample() -> Module {
    let v = Type::Vector(Box::new(Type::F64), 64);
    module(vec![
        func(
            "tri",
            vec![param("n", Type::I64)],
            Type::I64,
            vec![
                let_mut("acc", int(0)),
                let_mut("i", int(0)),
                while_(
                    lt(var("i"), var("n")),
                    vec![
                        assign("i", add(var("i"), int(1))),
                        assign("acc", add(var("acc"), var("i"))),
                    ],
                ),
                ret(var("acc")),
            ],
        ),
        func(
            "dot",
            vec![param("a", v.clone()), param("b", v)],
            Type::F64,
            vec![ret(intrinsic(Intrinsic::Dot, vec![var("a"), var("b")]))],
        ),
    ])
}

/// Benchmark the same loop interpreted and native
fn bench_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("loop_by_mode");

    for (label, policy) in [
        ("interpreted", ExecutionPolicy::InterpretOnly),
        ("native", ExecutionPolicy::PreferNative),
    ] {
        let engine = load(&sample(), EngineOptions::default().policy(policy)).unwrap();
        for n in [100i64, 10_000].iter() {
            group.bench_with_input(BenchmarkId::new(label, n), n, |b, &n| {
                b.iter(|| {
                    engine
                        .invoke(FunctionId(0), vec![TypedValue::i64(black_box(n))])
                        .unwrap()
                })
            });
        }
    }

    group.finish();
}

/// Benchmark a helper-backed tensor intrinsic
fn bench_dot(c: &mut Criterion) {
    let values: Vec<f64> = (0..64).map(|i| i as f64).collect();
    let a = TypedValue::vector_f64(&values);
    for (label, policy) in [
        ("dot interpreted", ExecutionPolicy::InterpretOnly),
        ("dot native", ExecutionPolicy::PreferNative),
    ] {
        let engine = load(&sample(), EngineOptions::default().policy(policy)).unwrap();
        c.bench_function(label, |b| {
            b.iter(|| engine.invoke(FunctionId(1), vec![a.clone(), a.clone()]).unwrap())
        });
    }
}

/// Benchmark sequential vs parallel batches
fn bench_parallel(c: &mut Criterion) {
    let engine = load(&sample(), EngineOptions::default()).unwrap();
    let batch: Vec<Invocation> = (0..64)
        .map(|i| Invocation::new(FunctionId(0), vec![TypedValue::i64(1_000 + i)]))
        .collect();
    let mut group = c.benchmark_group("batch");

    group.bench_function("sequential", |b| {
        b.iter(|| {
            batch
                .iter()
                .map(|inv| engine.invoke(inv.function, inv.args.clone()).unwrap())
                .count()
        })
    });
    group.bench_function("parallel", |b| {
        b.iter(|| invoke_parallel(&engine, black_box(batch.clone()), &ParallelConfig::default()).len())
    });

    group.finish();
}

criterion_group!(benches, bench_modes, bench_dot, bench_parallel);
criterion_main!(benches);
