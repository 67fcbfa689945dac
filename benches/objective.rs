//! Benchmark suite for mirt-em
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};

use mirt_em::{nll_grad_batch, CouplingMatrix, UserState, WorkerPool};

fn synthetic_population(num_users: usize, num_exercises: usize) -> (CouplingMatrix, Vec<UserState>) {
    let couplings = CouplingMatrix::from_flat(
        (0..num_exercises * 3).map(|i| (i as f64).sin() * 0.5).collect(),
        num_exercises,
        3,
    );
    let users = (0..num_users)
        .map(|u| {
            let attempts = 20;
            let exercise_ind: Vec<usize> = (0..attempts).map(|a| (u + a * 7) % num_exercises).collect();
            let correct: Vec<bool> = (0..attempts).map(|a| (u + a) % 3 != 0).collect();
            UserState::new(correct, exercise_ind, vec![0.3, -0.2])
        })
        .collect();
    (couplings, users)
}

fn bench_objective_serial(c: &mut Criterion) {
    let (couplings, users) = synthetic_population(200, 50);
    let pool = WorkerPool::new(0, 100).unwrap();
    c.bench_function("nll_grad_batch/serial", |b| {
        b.iter(|| nll_grad_batch(&couplings, &users, 1e-5, &pool).unwrap())
    });
}

fn bench_objective_parallel(c: &mut Criterion) {
    let (couplings, users) = synthetic_population(200, 50);
    let pool = WorkerPool::new(4, 25).unwrap();
    c.bench_function("nll_grad_batch/4_workers", |b| {
        b.iter(|| nll_grad_batch(&couplings, &users, 1e-5, &pool).unwrap())
    });
}

criterion_group!(benches, bench_objective_serial, bench_objective_parallel);
criterion_main!(benches);
