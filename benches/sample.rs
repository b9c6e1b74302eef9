use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use dram_rs::{Chain, DramChain, LogDensityFn, RunConfiguration};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn normal(dim: usize, mu: f64) -> LogDensityFn<impl Fn(&[f64]) -> f64 + Send + Sync + 'static> {
    LogDensityFn::new(dim, move |x: &[f64]| {
        -0.5 * x.iter().map(|v| (v - mu) * (v - mu)).sum::<f64>()
    })
}

fn settings(dim: usize, stages: usize) -> RunConfiguration {
    let mut settings = RunConfiguration::new(dim);
    settings.delayed_rejection.count = stages;
    settings
}

pub fn run_steps(dim: usize, stages: usize, steps: usize) -> f64 {
    let density = normal(dim, 3.);
    let settings = settings(dim, stages);
    let mut chain = DramChain::new(&density, &settings, ChaCha8Rng::seed_from_u64(42), 0).unwrap();
    chain.set_position(&vec![3.5; dim]).unwrap();
    for _ in 0..steps {
        chain.step().unwrap();
    }
    chain.state().logp
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("1000 steps normal 10", |b| {
        b.iter(|| run_steps(black_box(10), 0, 1000))
    });
    c.bench_function("1000 steps normal 10, 3 stages", |b| {
        b.iter(|| run_steps(black_box(10), 3, 1000))
    });
    c.bench_function("1000 steps normal 100", |b| {
        b.iter(|| run_steps(black_box(100), 0, 1000))
    });

    for dim in [10, 100] {
        let density = normal(dim, 3.);
        let settings = settings(dim, 2);
        let init = vec![3.5; dim];
        c.bench_function(&format!("single step normal {}", dim), |b| {
            b.iter_batched(
                || {
                    let mut chain =
                        DramChain::new(&density, &settings, ChaCha8Rng::seed_from_u64(42), 0)
                            .unwrap();
                    chain.set_position(&init).unwrap();
                    chain
                },
                |mut chain| {
                    chain.step().unwrap();
                    black_box(chain.state().logp)
                },
                BatchSize::SmallInput,
            )
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
