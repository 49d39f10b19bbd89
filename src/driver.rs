//! Running fits to completion.
//!
//! A [`Fitter`] drives an engine chosen by name over an initialized
//! [`FitContext`]: it iterates until the engine converges, fails, is
//! cancelled or reaches the iteration cap, then computes the parameter
//! errors and records a [`FitTrajectory`].
//!
//! When the context was split into independent per-dataset subordinate
//! contexts, each of them is fitted by its own engine and the fits run
//! concurrently on the rayon thread pool. The results are merged back in
//! dataset order, with a block-diagonal covariance matrix.

use crate::config::FitConfig;
use crate::engines::{default_registry, EngineRegistry, FitEngine, IterationStatus};
use crate::error::{FitError, Result};
use crate::fit::FitContext;
use crate::trajectory::{Ending, FitTrajectories, FitTrajectory};
use crate::uncertainty::{
    expand_covariance, relative_errors, scale_covariance, standard_errors_from_covariance,
};
use chrono::Utc;
use ndarray::{s, Array1, Array2};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The result of a complete fit.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    /// Final natural parameters, dataset after dataset.
    pub parameters: Vec<f64>,
    /// Standard errors of the natural parameters (zero for fixed and
    /// formula parameters).
    pub errors: Vec<f64>,
    /// Covariance of the natural parameters, scaled by the residual variance.
    pub covariance: Array2<f64>,
    /// Norm of the weighted residuals.
    pub residuals: f64,
    pub iterations: usize,
    pub ending: Ending,
    pub trajectory: FitTrajectory,
}

impl FitOutcome {
    pub fn converged(&self) -> bool {
        self.ending == Ending::Converged
    }
}

/// Severity used when merging the endings of subordinate fits.
fn severity(ending: Ending) -> u8 {
    match ending {
        Ending::Converged => 0,
        Ending::TimeOut => 1,
        Ending::NonFinite => 2,
        Ending::Cancelled => 3,
        Ending::Error => 4,
        Ending::Invalid => 5,
    }
}

/// Runs fits with a given configuration.
pub struct Fitter {
    context: Arc<FitContext>,
    config: FitConfig,
    registry: EngineRegistry,
    cancel: Arc<AtomicBool>,
}

impl Fitter {
    pub fn new(context: Arc<FitContext>, config: FitConfig) -> Self {
        Self {
            context,
            config,
            registry: default_registry().clone(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Uses engines from `registry` instead of the default ones.
    pub fn with_registry(mut self, registry: EngineRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Setting this flag stops the fit at the next iteration boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn context(&self) -> &Arc<FitContext> {
        &self.context
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Fits from `initial_guess` (natural parameters, dataset after dataset).
    ///
    /// Engine failures do not make this fail: they end the fit with
    /// [`Ending::Error`] and the best parameters reached so far.
    ///
    /// # Errors
    ///
    /// Setup errors: uninitialized context, unknown engine, invalid
    /// options, or an initial guess the engine cannot start from.
    pub fn run(&self, initial_guess: &[f64]) -> Result<FitOutcome> {
        if !self.context.is_initialized() {
            return Err(FitError::InvalidState(
                "the fit context must be initialized before fitting".to_string(),
            ));
        }
        if initial_guess.len() != self.context.natural_len() {
            return Err(FitError::Structural(format!(
                "initial guess has {} values, expected {}",
                initial_guess.len(),
                self.context.natural_len()
            )));
        }
        // the engine name is checked once, before any worker starts
        if self.registry.get(&self.config.engine).is_none() {
            return Err(FitError::UnknownEngine(self.config.engine.clone()));
        }

        let subordinates = self.context.subordinates();
        if self.config.split_independent && !subordinates.is_empty() {
            log::info!(
                "fitting {} independent datasets with {}",
                subordinates.len(),
                self.config.engine
            );
            let n = self.context.parameters_per_dataset();
            let outcomes = subordinates
                .par_iter()
                .enumerate()
                .map(|(ds, sub)| self.run_single(sub, &initial_guess[ds * n..(ds + 1) * n]))
                .collect::<Result<Vec<_>>>()?;
            Ok(self.merge(initial_guess, outcomes))
        } else {
            log::info!("fitting with {}", self.config.engine);
            self.run_single(&self.context, initial_guess)
        }
    }

    /// Runs one fit per initial guess and collects the trajectories.
    pub fn explore(&self, initial_guesses: &[Vec<f64>]) -> Result<FitTrajectories> {
        let mut trajectories = FitTrajectories::new();
        for guess in initial_guesses {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            trajectories.push(self.run(guess)?.trajectory);
        }
        Ok(trajectories)
    }

    fn run_single(&self, context: &Arc<FitContext>, initial_guess: &[f64]) -> Result<FitOutcome> {
        let start = Utc::now();
        let evaluations_before = context.evaluations();
        let mut engine = self.registry.create(&self.config.engine, Arc::clone(context))?;
        if !self.config.engine_options.is_empty() {
            engine.set_engine_options(&self.config.engine_options)?;
        }
        engine.initialize(initial_guess)?;

        let ending = self.iterate(engine.as_mut());
        let x = engine.current_parameters().clone();
        let parameters = context.unpack(&x)?;
        let residuals = context.residual_norm(&x).unwrap_or(f64::NAN);
        let covariance = natural_covariance(context, engine.as_mut(), &x, residuals);
        let errors = standard_errors_from_covariance(&covariance).to_vec();

        let data_norm = context.weighted_data().iter().map(|v| v * v).sum::<f64>().sqrt();
        let mut trajectory = FitTrajectory::new(initial_guess.to_vec(), engine.name());
        trajectory.parameter_errors = relative_errors(&Array1::from(errors.clone()), &parameters);
        trajectory.final_parameters = parameters.clone();
        trajectory.ending = ending;
        trajectory.residuals = residuals;
        trajectory.relative_residuals = if data_norm > 0.0 {
            residuals / data_norm
        } else {
            residuals
        };
        trajectory.internal_residuals = engine.residuals();
        trajectory.start_time = start;
        trajectory.end_time = Utc::now();
        trajectory.iterations = engine.iterations();
        trajectory.evaluations = context.evaluations() - evaluations_before;
        trajectory.flag_bad();

        log::info!(
            "fit ended ({}) after {} iterations, residuals {:e}",
            trajectory.ending,
            trajectory.iterations,
            residuals
        );
        Ok(FitOutcome {
            parameters,
            errors,
            covariance,
            residuals,
            iterations: trajectory.iterations,
            ending: trajectory.ending,
            trajectory,
        })
    }

    fn iterate(&self, engine: &mut dyn FitEngine) -> Ending {
        for _ in 0..self.config.max_iterations {
            if self.cancel.load(Ordering::Relaxed) {
                return Ending::Cancelled;
            }
            match engine.iterate() {
                Ok(IterationStatus::Success) => return Ending::Converged,
                Ok(IterationStatus::Continue) => {}
                Err(e) => {
                    log::warn!("{} failed: {}", engine.name(), e);
                    return Ending::Error;
                }
            }
        }
        Ending::TimeOut
    }

    fn merge(&self, initial_guess: &[f64], outcomes: Vec<FitOutcome>) -> FitOutcome {
        let total = self.context.natural_len();
        let mut covariance = Array2::zeros((total, total));
        let mut parameters = Vec::with_capacity(total);
        let mut errors = Vec::with_capacity(total);
        let mut trajectory = FitTrajectory::new(initial_guess.to_vec(), &self.config.engine);
        let mut squares = 0.0;
        let mut internal = 0.0;
        let mut iterations = 0;
        let mut ending = Ending::Converged;
        let mut evaluations = 0;
        let mut start = None;

        let mut offset = 0;
        for o in &outcomes {
            let len = o.parameters.len();
            covariance
                .slice_mut(s![offset..offset + len, offset..offset + len])
                .assign(&o.covariance);
            offset += len;
            parameters.extend_from_slice(&o.parameters);
            errors.extend_from_slice(&o.errors);
            squares += o.residuals * o.residuals;
            internal += o.trajectory.internal_residuals * o.trajectory.internal_residuals;
            iterations = iterations.max(o.iterations);
            evaluations += o.trajectory.evaluations;
            if severity(o.ending) > severity(ending) {
                ending = o.ending;
            }
            start = Some(match start {
                Some(s) if s < o.trajectory.start_time => s,
                _ => o.trajectory.start_time,
            });
        }

        let residuals = squares.sqrt();
        let data_norm = self
            .context
            .weighted_data()
            .iter()
            .map(|v| v * v)
            .sum::<f64>()
            .sqrt();
        trajectory.parameter_errors = relative_errors(&Array1::from(errors.clone()), &parameters);
        trajectory.final_parameters = parameters.clone();
        trajectory.ending = ending;
        trajectory.residuals = residuals;
        trajectory.relative_residuals = if data_norm > 0.0 {
            residuals / data_norm
        } else {
            residuals
        };
        trajectory.internal_residuals = internal.sqrt();
        trajectory.start_time = start.unwrap_or_else(Utc::now);
        trajectory.end_time = Utc::now();
        trajectory.iterations = iterations;
        trajectory.evaluations = evaluations;
        trajectory.flag_bad();

        FitOutcome {
            parameters,
            errors,
            covariance,
            residuals,
            iterations,
            ending: trajectory.ending,
            trajectory,
        }
    }
}

/// Scaled covariance of the natural parameters at `x`, zero when it
/// cannot be computed.
fn natural_covariance(
    context: &FitContext,
    engine: &mut dyn FitEngine,
    x: &Array1<f64>,
    residuals: f64,
) -> Array2<f64> {
    let covariance = engine
        .recompute_jacobian()
        .and_then(|_| engine.compute_covariance_matrix());
    match covariance {
        Ok(c) => {
            let scaled = scale_covariance(&c, residuals, context.degrees_of_freedom());
            expand_covariance(context, x, &scaled)
        }
        Err(e) => {
            log::warn!("could not compute the covariance matrix: {}", e);
            let n = context.natural_len();
            Array2::zeros((n, n))
        }
    }
}
