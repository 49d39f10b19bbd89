//! Tests for complete fits run by the driver

use crate::test_helpers::{
    decay_context, line_context, line_dataset, noisy_decay_dataset, wobbly_line_dataset,
};
use approx::assert_relative_eq;
use multifit_rs::{Ending, FitConfig, FitError, FitTrajectories, Fitter};
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[test]
fn test_fit_line() {
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 10)]);
    context.initialize(&[1.0, 0.0]).unwrap();
    let fitter = Fitter::new(Arc::new(context), FitConfig::default());
    let outcome = fitter.run(&[1.0, 0.0]).unwrap();

    assert!(outcome.converged());
    assert!(outcome.iterations <= 10);
    assert_relative_eq!(outcome.parameters[0], 2.0, epsilon = 1e-6);
    assert_relative_eq!(outcome.parameters[1], 1.0, epsilon = 1e-6);
    assert!(outcome.residuals < 1e-5);
    assert_eq!(outcome.trajectory.ending, Ending::Converged);
    assert_eq!(outcome.trajectory.engine, "qsoas");
    assert_eq!(outcome.trajectory.initial_parameters, vec![1.0, 0.0]);
    assert!(outcome.trajectory.evaluations > 0);
}

#[test]
fn test_fixed_parameter_has_zero_variance() {
    let mut context = line_context(vec![wobbly_line_dataset(2.0, 1.0, 20)]);
    context.set_fixed("intercept", None, true).unwrap();
    context.initialize(&[1.0, 1.0]).unwrap();
    let fitter = Fitter::new(Arc::new(context), FitConfig::default());
    let outcome = fitter.run(&[1.0, 1.0]).unwrap();

    assert!(outcome.converged());
    assert_eq!(outcome.parameters[1], 1.0);
    assert_eq!(outcome.errors[1], 0.0);
    assert_eq!(outcome.covariance[[1, 1]], 0.0);
    assert_eq!(outcome.covariance[[0, 1]], 0.0);
    assert!(outcome.errors[0] > 0.0);
}

#[test]
fn test_fixed_value_comes_from_the_fit_guess() {
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 10)]);
    context.set_fixed("intercept", None, true).unwrap();
    context.initialize(&[1.0, 0.0]).unwrap();
    let fitter = Fitter::new(Arc::new(context), FitConfig::default());

    let outcome = fitter.run(&[1.0, 1.0]).unwrap();
    assert!(outcome.converged());
    assert_eq!(outcome.parameters[1], 1.0);
    assert_relative_eq!(outcome.parameters[0], 2.0, epsilon = 1e-6);
    assert!(outcome.residuals < 1e-5);

    // a later fit with another fixed value does not keep the previous one
    let outcome = fitter.run(&[1.0, 3.0]).unwrap();
    assert_eq!(outcome.parameters[1], 3.0);
    assert!(outcome.residuals > 1e-3);
    assert_eq!(outcome.trajectory.initial_parameters, vec![1.0, 3.0]);
}

#[test]
fn test_explore_uses_each_fixed_value() {
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 10)]);
    context.set_fixed("intercept", None, true).unwrap();
    context.initialize(&[1.0, 0.0]).unwrap();
    let fitter = Fitter::new(Arc::new(context), FitConfig::default());

    let guesses = vec![vec![1.0, 1.0], vec![1.0, 3.0]];
    let trajectories = fitter.explore(&guesses).unwrap();
    assert_eq!(trajectories.len(), 2);
    let first = trajectories.get(0).unwrap();
    let second = trajectories.get(1).unwrap();
    assert_eq!(first.final_parameters[1], 1.0);
    assert_eq!(second.final_parameters[1], 3.0);
    assert!(first.residuals < second.residuals);
}

#[test]
fn test_fixed_values_reach_subordinate_fits() {
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 10), line_dataset(-1.0, 4.0, 10)]);
    context.set_fixed("intercept", None, true).unwrap();
    context.initialize(&[1.0, 0.0, 1.0, 0.0]).unwrap();
    assert_eq!(context.subordinates().len(), 2);

    let fitter = Fitter::new(Arc::new(context), FitConfig::default());
    let outcome = fitter.run(&[1.0, 1.0, 1.0, 4.0]).unwrap();
    assert!(outcome.converged());
    assert_eq!(outcome.parameters[1], 1.0);
    assert_eq!(outcome.parameters[3], 4.0);
    assert_relative_eq!(outcome.parameters[0], 2.0, epsilon = 1e-6);
    assert_relative_eq!(outcome.parameters[2], -1.0, epsilon = 1e-6);
}

#[test]
fn test_independent_datasets_fit_separately() {
    let mut context = line_context(vec![
        wobbly_line_dataset(2.0, 1.0, 15),
        wobbly_line_dataset(-1.0, 4.0, 15),
    ]);
    context.initialize(&[1.0, 0.0, 1.0, 0.0]).unwrap();
    assert_eq!(context.subordinates().len(), 2);

    let fitter = Fitter::new(Arc::new(context), FitConfig::default());
    let outcome = fitter.run(&[1.0, 0.0, 1.0, 0.0]).unwrap();
    assert_eq!(outcome.parameters.len(), 4);
    assert_relative_eq!(outcome.parameters[0], 2.0, epsilon = 0.05);
    assert_relative_eq!(outcome.parameters[2], -1.0, epsilon = 0.05);

    // no correlation between datasets
    assert_eq!(outcome.covariance.dim(), (4, 4));
    for i in 0..2 {
        for j in 2..4 {
            assert_eq!(outcome.covariance[[i, j]], 0.0);
            assert_eq!(outcome.covariance[[j, i]], 0.0);
        }
    }
    assert!(outcome.errors.iter().all(|e| *e > 0.0));
}

#[test]
fn test_split_matches_joint_fit() {
    let datasets = || vec![wobbly_line_dataset(2.0, 1.0, 15), wobbly_line_dataset(-1.0, 4.0, 15)];
    let guess = [1.0, 0.0, 1.0, 0.0];

    let mut split = line_context(datasets());
    split.initialize(&guess).unwrap();
    let split = Fitter::new(Arc::new(split), FitConfig::default())
        .run(&guess)
        .unwrap();

    let config = FitConfig::default().with_split_independent(false);
    let mut joint = line_context(datasets());
    joint.apply_config(&config);
    joint.set_threads(1);
    joint.initialize(&guess).unwrap();
    assert!(joint.subordinates().is_empty());
    let joint = Fitter::new(Arc::new(joint), config).run(&guess).unwrap();

    for (a, b) in split.parameters.iter().zip(&joint.parameters) {
        assert_relative_eq!(*a, *b, epsilon = 1e-4);
    }
    assert_relative_eq!(split.residuals, joint.residuals, max_relative = 1e-5);
}

#[test]
fn test_global_parameter_fit() {
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 10), line_dataset(3.0, 1.0, 10)]);
    context.set_global("intercept", true).unwrap();
    context.initialize(&[1.0, 0.0, 1.0, 0.0]).unwrap();
    let fitter = Fitter::new(Arc::new(context), FitConfig::default());
    let outcome = fitter.run(&[1.0, 0.0, 1.0, 0.0]).unwrap();

    assert!(outcome.converged());
    assert_relative_eq!(outcome.parameters[0], 2.0, epsilon = 1e-6);
    assert_relative_eq!(outcome.parameters[2], 3.0, epsilon = 1e-6);
    assert_eq!(outcome.parameters[1], outcome.parameters[3]);
    assert_relative_eq!(outcome.parameters[1], 1.0, epsilon = 1e-6);
}

#[test]
fn test_iteration_cap() {
    let mut context = decay_context(vec![noisy_decay_dataset(5.0, 0.7, 1.0, 0.01, 3)]);
    context.initialize(&[1.0, 2.0, 0.0]).unwrap();
    let context = Arc::new(context);

    let config = FitConfig::default().with_max_iterations(1);
    let outcome = Fitter::new(Arc::clone(&context), config).run(&[1.0, 2.0, 0.0]).unwrap();
    assert_eq!(outcome.ending, Ending::TimeOut);
    assert_eq!(outcome.iterations, 1);

    let config = FitConfig::default().with_max_iterations(0);
    let outcome = Fitter::new(context, config).run(&[1.0, 2.0, 0.0]).unwrap();
    assert_eq!(outcome.ending, Ending::TimeOut);
    assert_eq!(outcome.iterations, 0);
    assert_eq!(outcome.parameters, vec![1.0, 2.0, 0.0]);
}

#[test]
fn test_cancelled_fit_keeps_start() {
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 10)]);
    context.initialize(&[1.0, 0.0]).unwrap();
    let fitter = Fitter::new(Arc::new(context), FitConfig::default());
    fitter.cancel_flag().store(true, Ordering::Relaxed);

    let outcome = fitter.run(&[1.0, 0.0]).unwrap();
    assert_eq!(outcome.ending, Ending::Cancelled);
    assert_eq!(outcome.iterations, 0);
    assert_eq!(outcome.parameters, vec![1.0, 0.0]);
}

#[test]
fn test_setup_errors() {
    let context = line_context(vec![line_dataset(2.0, 1.0, 10)]);
    let fitter = Fitter::new(Arc::new(context), FitConfig::default());
    assert!(matches!(fitter.run(&[1.0, 0.0]), Err(FitError::InvalidState(_))));

    let mut context = line_context(vec![line_dataset(2.0, 1.0, 10)]);
    context.initialize(&[1.0, 0.0]).unwrap();
    let context = Arc::new(context);
    let fitter = Fitter::new(Arc::clone(&context), FitConfig::default().with_engine("nope"));
    assert!(matches!(fitter.run(&[1.0, 0.0]), Err(FitError::UnknownEngine(_))));

    let fitter = Fitter::new(
        Arc::clone(&context),
        FitConfig::default().with_option("bogus", 1.0),
    );
    assert!(matches!(fitter.run(&[1.0, 0.0]), Err(FitError::InvalidOption(_))));

    let fitter = Fitter::new(context, FitConfig::default());
    assert!(matches!(fitter.run(&[1.0]), Err(FitError::Structural(_))));
}

#[test]
fn test_every_engine_through_the_driver() {
    let mut context = line_context(vec![wobbly_line_dataset(2.0, 1.0, 20)]);
    // pso scales the start multiplicatively, so no zero component
    context.initialize(&[1.0, 0.5]).unwrap();
    let context = Arc::new(context);
    // odrpack holds a process-wide slot and is covered by the engine tests
    for engine in ["qsoas", "lm", "lm-scaled", "lm-nielsen", "simplex", "pso"] {
        let config = FitConfig::default()
            .with_engine(engine)
            .with_max_iterations(400);
        let config = if engine == "pso" {
            config.with_option("seed", 11.0)
        } else {
            config
        };
        let outcome = Fitter::new(Arc::clone(&context), config)
            .run(&[1.0, 0.5])
            .unwrap();
        assert_ne!(outcome.ending, Ending::Error, "{}", engine);
        assert_ne!(outcome.ending, Ending::NonFinite, "{}", engine);
        assert_relative_eq!(outcome.parameters[0], 2.0, epsilon = 0.1);
        assert_eq!(outcome.trajectory.engine, engine);
    }
}

#[test]
fn test_explore_and_save_trajectories() {
    let mut context = line_context(vec![wobbly_line_dataset(2.0, 1.0, 20)]);
    context.initialize(&[1.0, 0.0]).unwrap();
    let fitter = Fitter::new(Arc::new(context), FitConfig::default());

    let guesses = vec![vec![1.0, 0.0], vec![-3.0, 5.0], vec![10.0, -10.0]];
    let mut trajectories = fitter.explore(&guesses).unwrap();
    assert_eq!(trajectories.len(), 3);
    trajectories.sort();
    let best = trajectories.best().unwrap();
    assert_relative_eq!(best.final_parameters[0], 2.0, epsilon = 0.05);
    // every start ends in the same minimum
    assert_eq!(trajectories.cluster().len(), 1);

    let mut buffer = Vec::new();
    trajectories.save(&mut buffer).unwrap();
    let loaded = FitTrajectories::load(buffer.as_slice()).unwrap();
    assert_eq!(loaded.len(), 3);
    for (a, b) in loaded.iter().zip(trajectories.iter()) {
        assert_eq!(a.ending, b.ending);
        assert_eq!(a.engine, b.engine);
        assert_eq!(a.iterations, b.iterations);
        assert_relative_eq!(a.residuals, b.residuals, max_relative = 1e-12);
        assert_eq!(a.initial_parameters, b.initial_parameters);
    }
}
