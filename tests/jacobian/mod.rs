//! Tests for the concurrent Jacobian evaluation

use crate::test_helpers::{line_dataset, shared, sine_series_model};
use approx::assert_relative_eq;
use multifit_rs::jacobian::{JobQueue, Terminated};
use multifit_rs::FitContext;
use ndarray::Array1;
use std::sync::Arc;
use std::thread;

fn series_context(threads: i32) -> FitContext {
    let model = sine_series_model(20);
    let mut context = FitContext::new(model, shared(vec![line_dataset(0.5, 1.0, 50)])).unwrap();
    context.set_threads(threads);
    context.initialize(&[1.0; 20]).unwrap();
    context
}

#[test]
fn test_one_job_per_free_parameter() {
    let context = series_context(4);
    assert_eq!(context.jacobian_threads(), 4);
    assert_eq!(context.jobs_scheduled(), 0);

    let x = Array1::from_elem(20, 0.3);
    context.df(&x).unwrap();
    assert_eq!(context.jobs_scheduled(), 20);
    context.df(&x).unwrap();
    assert_eq!(context.jobs_scheduled(), 40);
}

#[test]
fn test_pooled_matches_sequential() {
    let context = series_context(4);
    let x = Array1::linspace(-1.0, 1.0, 20);
    let base = context.f(&x).unwrap();

    let pooled = context.df_at(&x, &base).unwrap();
    let sequential = context.df_sequential(&x, &base).unwrap();
    assert_eq!(pooled.rows(), 50);
    assert_eq!(pooled.columns(), 20);
    for i in 0..pooled.rows() {
        for j in 0..pooled.columns() {
            assert_relative_eq!(pooled.get(i, j), sequential.get(i, j), epsilon = 1e-12);
        }
    }

    // d/dp_j of sum_i p_i sin((i + 1) x) is sin((j + 1) x)
    let xs = Array1::linspace(0.0, 49.0, 50);
    for j in [0, 7, 19] {
        for i in [0, 10, 49] {
            let expected = ((j + 1) as f64 * xs[i]).sin();
            assert_relative_eq!(pooled.get(i, j), expected, epsilon = 1e-5);
        }
    }
}

#[test]
fn test_single_thread_has_no_pool() {
    let context = series_context(1);
    assert_eq!(context.jacobian_threads(), 1);
    context.df(&Array1::zeros(20)).unwrap();
    assert_eq!(context.jobs_scheduled(), 0);
}

#[test]
fn test_multi_dataset_jacobian_is_block_sparse() {
    let model = sine_series_model(2);
    let datasets = shared(vec![line_dataset(1.0, 0.0, 5), line_dataset(2.0, 0.0, 7)]);
    let mut context = FitContext::new(model, datasets).unwrap();
    context.set_threads(2);
    context.set_split_independent(false);
    context.initialize(&[1.0, 1.0, 1.0, 1.0]).unwrap();

    let x = context.pack(&[1.0, 1.0, 1.0, 1.0]).unwrap();
    let jacobian = context.df(&x).unwrap();
    assert_eq!(jacobian.rows(), 12);
    assert_eq!(jacobian.columns(), 4);
    for j in 0..4 {
        let rows = jacobian.column_rows(j);
        for i in 0..12 {
            if !rows.contains(&i) {
                assert!(jacobian.is_structurally_zero(i, j));
                assert_eq!(jacobian.get(i, j), 0.0);
            }
        }
    }
}

#[test]
fn test_job_queue_drains_before_terminate() {
    let queue = Arc::new(JobQueue::new(2));
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut sum = 0;
            while let Ok(job) = queue.next_job() {
                sum += job;
                queue.done_job();
            }
            sum
        })
    };
    for i in 1..=10 {
        queue.enqueue(i).unwrap();
    }
    queue.wait_for_jobs_done();
    assert_eq!(queue.remaining_jobs(), 0);
    assert_eq!(queue.jobs_scheduled(), 10);
    queue.terminate();
    assert_eq!(consumer.join().unwrap(), 55);
    assert_eq!(queue.enqueue(11), Err(Terminated));
}
