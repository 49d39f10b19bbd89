//! Tests for covariance matrices and parameter errors

use crate::test_helpers::{line_context, wobbly_line_dataset};
use approx::assert_relative_eq;
use multifit_rs::uncertainty::{
    calculate_correlation, confidence_intervals, invert_svd, student_t_quantile,
};
use multifit_rs::{Bijection, Dataset, FitConfig, Fitter};
use ndarray::array;
use std::sync::Arc;

/// Closed-form standard errors of a straight line fit.
fn line_errors(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len() as f64;
    let sx: f64 = x.iter().sum();
    let sxx: f64 = x.iter().map(|v| v * v).sum();
    let sy: f64 = y.iter().sum();
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    let det = n * sxx - sx * sx;
    let slope = (n * sxy - sx * sy) / det;
    let intercept = (sy - slope * sx) / n;
    let ssr: f64 = x
        .iter()
        .zip(y)
        .map(|(a, b)| (slope * a + intercept - b).powi(2))
        .sum();
    let variance = ssr / (n - 2.0);
    ((variance * n / det).sqrt(), (variance * sxx / det).sqrt())
}

#[test]
fn test_line_errors_match_closed_form() {
    let data = wobbly_line_dataset(2.0, 1.0, 25);
    let (expected_slope, expected_intercept) =
        line_errors(data.x().as_slice().unwrap(), data.y().as_slice().unwrap());

    let mut context = line_context(vec![data]);
    context.initialize(&[1.0, 0.0]).unwrap();
    let outcome = Fitter::new(Arc::new(context), FitConfig::default())
        .run(&[1.0, 0.0])
        .unwrap();
    assert!(outcome.converged());
    assert_relative_eq!(outcome.errors[0], expected_slope, max_relative = 1e-3);
    assert_relative_eq!(outcome.errors[1], expected_intercept, max_relative = 1e-3);

    let correlation = calculate_correlation(&outcome.covariance);
    assert_relative_eq!(correlation[[0, 0]], 1.0);
    // slope and intercept of points at positive x are anti-correlated
    assert!(correlation[[0, 1]] < 0.0);
    assert_relative_eq!(correlation[[0, 1]], correlation[[1, 0]], epsilon = 1e-12);
}

#[test]
fn test_errors_through_a_bijection() {
    let run = |bijection: Option<Bijection>| {
        let mut context = line_context(vec![wobbly_line_dataset(2.0, 1.0, 25)]);
        context.set_bijection("slope", None, bijection).unwrap();
        context.initialize(&[1.0, 0.5]).unwrap();
        Fitter::new(Arc::new(context), FitConfig::default())
            .run(&[1.0, 0.5])
            .unwrap()
    };
    let plain = run(None);
    let logged = run(Some(Bijection::Log));
    assert_relative_eq!(plain.parameters[0], logged.parameters[0], max_relative = 1e-4);
    // first-order propagation gives back the natural-space error
    assert_relative_eq!(plain.errors[0], logged.errors[0], max_relative = 1e-2);
    assert_relative_eq!(plain.errors[1], logged.errors[1], max_relative = 1e-2);
}

#[test]
fn test_pseudo_inverse_drops_null_directions() {
    // rank one: both parameters only ever appear as a sum
    let jtj = array![[1.0, 1.0], [1.0, 1.0]];
    let inverse = invert_svd(&jtj, 1e-7).unwrap();
    for v in inverse.iter() {
        assert_relative_eq!(*v, 0.25, epsilon = 1e-12);
    }
}

#[test]
fn test_confidence_intervals() {
    let t = student_t_quantile(0.975, 10).unwrap();
    assert_relative_eq!(t, 2.228, epsilon = 1e-3);

    let intervals = confidence_intervals(&[2.0, 1.0], &[0.1, 0.0], 10, 0.95).unwrap();
    assert_relative_eq!(intervals[0].0, 2.0 - 0.1 * t, epsilon = 1e-12);
    assert_relative_eq!(intervals[0].1, 2.0 + 0.1 * t, epsilon = 1e-12);
    assert_eq!(intervals[1], (1.0, 1.0));
}
