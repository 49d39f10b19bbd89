//! Benchmarks for the Jacobian evaluation.
//!
//! Compares the worker pool with the sequential evaluation for models of
//! increasing cost, and times complete fits with the main engines.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use multifit_rs::models::exponential_decay_model;
use multifit_rs::parameters::definitions;
use multifit_rs::{DataSet, Dataset, FitConfig, FitContext, Fitter, FunctionModel};
use ndarray::Array1;
use std::sync::Arc;

/// `sum_i p_i sin((i + 1) x)`, padded with `work` extra transcendental
/// calls per point to make evaluations expensive.
fn series_context(parameters: usize, work: usize, threads: i32) -> FitContext {
    let names: Vec<String> = (0..parameters).map(|i| format!("p{}", i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let model = FunctionModel::new(definitions(&refs), move |p, x| {
        let mut extra = 0.0;
        for k in 0..work {
            extra += (x + k as f64).sqrt().ln_1p() * 1e-12;
        }
        Ok(p.iter()
            .enumerate()
            .map(|(i, c)| c * ((i + 1) as f64 * x).sin())
            .sum::<f64>()
            + extra)
    });
    let x = Array1::linspace(0.0, 20.0, 500);
    let data = DataSet::from_fn(x, |x| x.sin());
    let datasets: Vec<Arc<dyn Dataset>> = vec![Arc::new(data)];
    let mut context = FitContext::new(Arc::new(model), datasets).unwrap();
    context.set_threads(threads);
    context.initialize(&vec![1.0; parameters]).unwrap();
    context
}

fn bench_jacobian(c: &mut Criterion) {
    let mut group = c.benchmark_group("jacobian");
    for work in [0, 50] {
        let sequential = series_context(20, work, 1);
        let pooled = series_context(20, work, 0);
        let x = Array1::from_elem(20, 0.5);
        let base = sequential.f(&x).unwrap();

        group.bench_with_input(BenchmarkId::new("sequential", work), &work, |b, _| {
            b.iter(|| sequential.df_sequential(black_box(&x), &base).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("pooled", work), &work, |b, _| {
            b.iter(|| pooled.df_at(black_box(&x), &base).unwrap())
        });
    }
    group.finish();
}

fn bench_fit(c: &mut Criterion) {
    let x = Array1::linspace(0.0, 10.0, 200);
    let data = DataSet::from_fn(x, |x| 5.0 * (-0.7 * x).exp() + 1.0);
    let datasets: Vec<Arc<dyn Dataset>> = vec![Arc::new(data)];
    let mut context = FitContext::new(Arc::new(exponential_decay_model("")), datasets).unwrap();
    context.set_threads(1);
    let guess = context.model_initial_guess();
    context.initialize(&guess).unwrap();
    let context = Arc::new(context);

    let mut group = c.benchmark_group("decay_fit");
    for engine in ["qsoas", "lm", "lm-scaled", "simplex"] {
        let fitter = Fitter::new(
            Arc::clone(&context),
            FitConfig::default().with_engine(engine).with_max_iterations(500),
        );
        group.bench_function(engine, |b| b.iter(|| fitter.run(black_box(&guess)).unwrap()));
    }
    group.finish();
}

criterion_group!(benches, bench_jacobian, bench_fit);
criterion_main!(benches);
