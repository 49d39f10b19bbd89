//! Tests for the parameter model and the fit context

use crate::test_helpers::{line_context, line_dataset, shared};
use approx::assert_relative_eq;
use multifit_rs::parameters::definitions;
use multifit_rs::{Bijection, DataSet, FitContext, FitError, FunctionModel};
use ndarray::array;
use std::sync::Arc;

#[test]
fn test_pack_unpack_round_trip() {
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 10)]);
    context
        .set_bijection("slope", None, Some(Bijection::Log))
        .unwrap();
    let natural = [3.0, -4.0];
    context.initialize(&natural).unwrap();

    let x = context.pack(&natural).unwrap();
    assert_eq!(x.len(), 2);
    let back = context.unpack(&x).unwrap();
    assert_relative_eq!(back[0], 3.0, epsilon = 1e-12);
    assert_relative_eq!(back[1], -4.0, epsilon = 1e-12);
}

#[test]
fn test_global_parameter_is_broadcast() {
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 10), line_dataset(3.0, 1.0, 10)]);
    context.set_global("intercept", true).unwrap();
    let natural = [2.0, 1.0, 3.0, 1.0];
    context.initialize(&natural).unwrap();

    assert_eq!(context.free_parameters(), 3);
    assert_eq!(context.natural_len(), 4);
    let x = context.pack(&natural).unwrap();
    assert_eq!(x.len(), 3);

    let back = context.unpack(&x).unwrap();
    assert_eq!(back[1], back[3]);
    assert_relative_eq!(back[0], 2.0, epsilon = 1e-12);
    assert_relative_eq!(back[2], 3.0, epsilon = 1e-12);

    // a global free parameter couples the datasets
    assert!(!context.independent_datasets());
    assert!(context.subordinates().is_empty());
}

#[test]
fn test_fixed_parameter_has_no_slot() {
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 10)]);
    context.set_fixed("intercept", None, true).unwrap();
    context.initialize(&[1.0, 1.0]).unwrap();
    assert_eq!(context.free_parameters(), 1);

    let back = context.unpack(&array![5.0]).unwrap();
    assert_eq!(back, vec![5.0, 1.0]);

    // packing reads the fixed value again
    let x = context.pack(&[5.0, 2.5]).unwrap();
    assert_eq!(x.len(), 1);
    assert_eq!(context.unpack(&x).unwrap(), vec![5.0, 2.5]);
}

#[test]
fn test_degrees_of_freedom() {
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 2)]);
    context.initialize(&[1.0, 1.0]).unwrap();
    assert_eq!(context.degrees_of_freedom(), 0);

    // more free parameters than points
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 1)]);
    let err = context.initialize(&[1.0, 1.0]).unwrap_err();
    assert!(err.is_structural());
}

fn three_parameter_context() -> FitContext {
    let model = FunctionModel::new(definitions(&["a", "b", "c"]), |p, x| {
        Ok(p[0] * x + p[1] + p[2])
    });
    let mut context = FitContext::new(Arc::new(model), shared(vec![line_dataset(1.0, 0.0, 5)]))
        .unwrap();
    context.set_threads(1);
    context
}

#[test]
fn test_formula_parameter() {
    let mut context = three_parameter_context();
    context.set_formula("c", None, "a + b").unwrap();
    context.initialize(&[2.0, 1.0, 0.0]).unwrap();
    assert_eq!(context.free_parameters(), 2);

    let x = context.pack(&[2.0, 1.0, 0.0]).unwrap();
    let natural = context.unpack(&x).unwrap();
    assert_relative_eq!(natural[2], 3.0, epsilon = 1e-12);
}

#[test]
fn test_formula_with_unknown_name() {
    let mut context = three_parameter_context();
    context.set_formula("c", None, "a + z").unwrap();
    let err = context.initialize(&[2.0, 1.0, 0.0]).unwrap_err();
    assert!(err.is_structural(), "unexpected error {:?}", err);
}

#[test]
fn test_cyclic_formulas() {
    let mut context = three_parameter_context();
    context.set_formula("b", None, "c * 2").unwrap();
    context.set_formula("c", None, "b + 1").unwrap();
    let err = context.initialize(&[2.0, 1.0, 0.0]).unwrap_err();
    assert!(matches!(err, FitError::Structural(_)), "unexpected error {:?}", err);
}

#[test]
fn test_weighted_residuals() {
    let data = line_dataset(2.0, 1.0, 4)
        .with_errors(array![0.5, 0.5, 0.5, 0.5])
        .unwrap();
    let mut context = line_context(vec![data]);
    context.initialize(&[2.0, 0.0]).unwrap();

    // model - data = -1 everywhere, weighted by 1 / 0.5
    let f = context.f(&array![2.0, 0.0]).unwrap();
    for v in f.iter() {
        assert_relative_eq!(*v, -2.0, epsilon = 1e-12);
    }
    assert_relative_eq!(context.chi_square(&array![2.0, 0.0]).unwrap(), 16.0, epsilon = 1e-12);

    // same data without error weighting
    let data = line_dataset(2.0, 1.0, 4)
        .with_errors(array![0.5, 0.5, 0.5, 0.5])
        .unwrap();
    let mut context = line_context(vec![data]);
    context.set_use_errors(false);
    context.initialize(&[2.0, 0.0]).unwrap();
    assert_relative_eq!(context.residual_norm(&array![2.0, 0.0]).unwrap(), 2.0, epsilon = 1e-12);
}

#[test]
fn test_independent_datasets_are_split() {
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 6), line_dataset(-1.0, 3.0, 6)]);
    context.initialize(&[1.0, 0.0, 1.0, 0.0]).unwrap();
    assert!(context.independent_datasets());
    assert_eq!(context.subordinates().len(), 2);
    for sub in context.subordinates() {
        assert_eq!(sub.dataset_count(), 1);
        assert_eq!(sub.free_parameters(), 2);
        assert_eq!(sub.jacobian_threads(), 1);
    }

    context.set_split_independent(false);
    context.initialize(&[1.0, 0.0, 1.0, 0.0]).unwrap();
    assert!(context.subordinates().is_empty());
}

#[test]
fn test_uninitialized_context() {
    let context = line_context(vec![DataSet::new(array![0.0, 1.0], array![1.0, 2.0]).unwrap()]);
    assert!(matches!(
        context.pack(&[1.0, 1.0]),
        Err(FitError::InvalidState(_))
    ));
}
