//! Tests for the fit engines

use crate::test_helpers::{
    assert_finite, decay_context, init_logging, line_context, line_dataset, noisy_decay_dataset,
};
use approx::assert_relative_eq;
use multifit_rs::engines::lm::{LmEngine, LmVariant};
use multifit_rs::engines::pso::ParticleSwarmEngine;
use multifit_rs::engines::qsoas::QSoasEngine;
use multifit_rs::engines::simplex::SimplexEngine;
use multifit_rs::engines::EngineState;
use multifit_rs::{
    default_registry, EngineOptions, FitContext, FitEngine, FitError, IterationStatus,
};
use std::sync::Arc;

/// Iterates until convergence; returns the number of iterations, or
/// `None` if the engine did not converge within `max` iterations.
fn run(engine: &mut dyn FitEngine, max: usize) -> Option<usize> {
    for i in 1..=max {
        match engine.iterate() {
            Ok(IterationStatus::Success) => return Some(i),
            Ok(IterationStatus::Continue) => {}
            Err(e) => panic!("{} failed: {}", engine.name(), e),
        }
    }
    None
}

fn decay_fixture() -> Arc<FitContext> {
    let mut context = decay_context(vec![noisy_decay_dataset(5.0, 0.7, 1.0, 0.01, 42)]);
    let guess = context.model_initial_guess();
    context.initialize(&guess).unwrap();
    Arc::new(context)
}

#[test]
fn test_qsoas_exact_line() {
    init_logging();
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 5)]);
    context.initialize(&[1.0, 0.0]).unwrap();
    let context = Arc::new(context);

    let mut engine = QSoasEngine::new(Arc::clone(&context));
    engine.initialize(&[1.0, 0.0]).unwrap();
    let iterations = run(&mut engine, 10).expect("no convergence within 10 iterations");
    assert!(iterations <= 10);
    assert_eq!(engine.state(), EngineState::Converged);

    let x = engine.current_parameters().clone();
    assert!(context.chi_square(&x).unwrap() < 1e-10);
    let p = context.unpack(&x).unwrap();
    assert_relative_eq!(p[0], 2.0, epsilon = 1e-6);
    assert_relative_eq!(p[1], 1.0, epsilon = 1e-6);
}

#[test]
fn test_levenberg_marquardt_variants_on_decay() {
    init_logging();
    let context = decay_fixture();
    let guess = context.model_initial_guess();
    for variant in [LmVariant::Unscaled, LmVariant::Scaled, LmVariant::Nielsen] {
        let mut engine = LmEngine::new(Arc::clone(&context), variant);
        engine.initialize(&guess).unwrap();
        run(&mut engine, 200).unwrap_or_else(|| panic!("{} did not converge", variant.name()));

        let p = context.unpack(engine.current_parameters()).unwrap();
        assert_relative_eq!(p[0], 5.0, epsilon = 0.05);
        assert_relative_eq!(p[1], 0.7, epsilon = 0.02);
        assert_relative_eq!(p[2], 1.0, epsilon = 0.02);
        // noise of 0.01 on 60 points
        assert!(engine.residuals() < 0.2, "{}: {}", variant.name(), engine.residuals());

        let covariance = engine.compute_covariance_matrix().unwrap();
        assert_eq!(covariance.dim(), (3, 3));
        assert!((0..3).all(|i| covariance[[i, i]] > 0.0));
    }
}

#[test]
fn test_qsoas_on_decay() {
    let context = decay_fixture();
    let mut engine = QSoasEngine::new(Arc::clone(&context));
    engine.initialize(&context.model_initial_guess()).unwrap();
    run(&mut engine, 200).expect("no convergence");
    let p = context.unpack(engine.current_parameters()).unwrap();
    assert_relative_eq!(p[1], 0.7, epsilon = 0.02);
}

#[test]
fn test_derivative_free_engines_stay_in_domain() {
    init_logging();
    let context = decay_fixture();
    // start right next to the forbidden negative rates
    let guess = [4.0, 0.02, 1.0];

    let mut simplex = SimplexEngine::new(Arc::clone(&context));
    let mut pso = ParticleSwarmEngine::new(Arc::clone(&context));
    pso.set_engine_options(&EngineOptions::new().with("seed", 7.0).with("particles", 20.0))
        .unwrap();

    let engines: [&mut dyn FitEngine; 2] = [&mut simplex, &mut pso];
    for engine in engines {
        engine.initialize(&guess).unwrap();
        for _ in 0..150 {
            let outcome = engine.iterate();
            let x = engine.current_parameters().clone();
            let p = context.unpack(&x).unwrap();
            assert!(p[1] >= 0.0, "{} ended at rate {}", engine.name(), p[1]);
            assert_finite(&p);
            assert!(context.chi_square(&x).unwrap().is_finite());
            match outcome {
                Ok(IterationStatus::Continue) => {}
                _ => break,
            }
        }
        assert!(engine.residuals().is_finite());
    }
}

#[test]
fn test_simplex_improves_decay() {
    let context = decay_fixture();
    let guess = context.model_initial_guess();
    let start = context.residual_norm(&context.pack(&guess).unwrap()).unwrap();

    let mut engine = SimplexEngine::new(Arc::clone(&context));
    engine.initialize(&guess).unwrap();
    let _ = run_lenient(&mut engine, 500);
    assert!(engine.residuals() < start);
    assert!(engine.iterations() > 0);
}

fn run_lenient(engine: &mut dyn FitEngine, max: usize) -> Result<(), FitError> {
    for _ in 0..max {
        if engine.iterate()? == IterationStatus::Success {
            break;
        }
    }
    Ok(())
}

#[test]
fn test_pso_is_reproducible_with_seed() {
    let context = decay_fixture();
    let guess = context.model_initial_guess();
    let options = EngineOptions::new().with("seed", 123.0);

    let mut results = Vec::new();
    for _ in 0..2 {
        let mut engine = ParticleSwarmEngine::new(Arc::clone(&context));
        engine.set_engine_options(&options).unwrap();
        engine.initialize(&guess).unwrap();
        let _ = run_lenient(&mut engine, 20);
        results.push(engine.current_parameters().clone());
    }
    assert_eq!(results[0], results[1]);
}

#[test]
fn test_iterate_before_initialize() {
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 5)]);
    context.initialize(&[1.0, 1.0]).unwrap();
    let context = Arc::new(context);
    for name in default_registry().names() {
        let mut engine = default_registry().create(name, Arc::clone(&context)).unwrap();
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(matches!(engine.iterate(), Err(FitError::InvalidState(_))));
    }
}

#[test]
fn test_engine_options() {
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 5)]);
    context.initialize(&[1.0, 1.0]).unwrap();
    let context = Arc::new(context);

    let mut engine = QSoasEngine::new(Arc::clone(&context));
    assert_eq!(engine.engine_options().get("scale"), Some(2.0));
    engine
        .set_engine_options(&EngineOptions::new().with("scale", 3.0))
        .unwrap();
    assert_eq!(engine.engine_options().get("scale"), Some(3.0));

    assert!(matches!(
        engine.set_engine_options(&EngineOptions::new().with("scale", 0.5)),
        Err(FitError::InvalidOption(_))
    ));
    assert!(matches!(
        engine.set_engine_options(&EngineOptions::new().with("no-such-option", 1.0)),
        Err(FitError::InvalidOption(_))
    ));

    let mut simplex = SimplexEngine::new(context);
    simplex
        .set_engine_options(&EngineOptions::new().with("end-threshold", 1e-6))
        .unwrap();
    assert_eq!(simplex.engine_options().get("end-threshold"), Some(1e-6));
}

#[test]
fn test_unknown_engine() {
    let mut context = line_context(vec![line_dataset(2.0, 1.0, 5)]);
    context.initialize(&[1.0, 1.0]).unwrap();
    let err = default_registry()
        .create("gauss-newton", Arc::new(context))
        .err()
        .unwrap();
    assert!(matches!(err, FitError::UnknownEngine(_)));
    assert!(err.to_string().contains("qsoas"));
}

/// Covariance reported by the ODR engine for `y = 2x` fitted with
/// `a x + b (x + 1e-4 x²)`, where one direction of JᵗJ is about 1e-8
/// times weaker than the other.
#[cfg(feature = "odr")]
fn odr_nearly_degenerate_covariance(threshold: f64) -> ndarray::Array2<f64> {
    use crate::test_helpers::shared;
    use multifit_rs::engines::odr::OdrEngine;
    use multifit_rs::parameters::definitions;
    use multifit_rs::FunctionModel;

    let model = FunctionModel::new(definitions(&["a", "b"]), |p, x| {
        Ok(p[0] * x + p[1] * (x + 1e-4 * x * x))
    });
    let mut context =
        FitContext::new(Arc::new(model), shared(vec![line_dataset(2.0, 0.0, 10)])).unwrap();
    context.set_threads(1);
    context.set_svd_threshold(threshold);
    context.initialize(&[1.0, 1.0]).unwrap();

    let mut engine = OdrEngine::new(Arc::new(context));
    engine.initialize(&[1.0, 1.0]).unwrap();
    for _ in 0..100 {
        if !matches!(engine.iterate(), Ok(IterationStatus::Continue)) {
            break;
        }
    }
    engine.compute_covariance_matrix().unwrap()
}

// the ODR engine holds a process-wide slot while iterating, so all of its
// fits run inside this one test
#[cfg(feature = "odr")]
#[test]
fn test_odr_engine() {
    use multifit_rs::engines::odr::OdrEngine;

    let context = decay_fixture();
    let mut engine = OdrEngine::new(Arc::clone(&context));
    engine.initialize(&context.model_initial_guess()).unwrap();
    run(&mut engine, 200).expect("no convergence");
    let p = context.unpack(engine.current_parameters()).unwrap();
    assert_relative_eq!(p[1], 0.7, epsilon = 0.02);
    assert!(engine.reciprocal_condition() > 0.0);
    assert_eq!(engine.standard_deviations().len(), 3);

    // the weak direction is dropped by the default threshold only
    let truncated = odr_nearly_degenerate_covariance(1e-7);
    let full = odr_nearly_degenerate_covariance(1e-14);
    assert!(truncated[[0, 0]] > 0.0);
    assert!(
        full[[0, 0]] > 1e3 * truncated[[0, 0]],
        "{} vs {}",
        full[[0, 0]],
        truncated[[0, 0]]
    );
}
