//! The native Levenberg-Marquardt engine.
//!
//! Unlike the trust-region variants in [`lm`](super::lm), this engine keeps
//! the gradient and the JᵗJ matrix itself and, at each iteration, tries two
//! steps at once: one at the current damping λ and a less damped one at
//! λ/ν. The better one is taken when it improves the residuals; otherwise
//! λ grows by ν until a step does, or the number of tries is exhausted.

use super::{
    sum_of_squares, EngineBase, EngineOptionSpec, EngineOptions, EngineState, FitEngine,
    IterationStatus,
};
use crate::error::{FitError, Result};
use crate::fit::FitContext;
use crate::uncertainty::invert_svd;
use crate::utils::solve_lu;
use ndarray::{Array1, Array2};
use std::sync::Arc;

/// Option schema of the native Levenberg-Marquardt engine.
pub fn qsoas_options() -> Vec<EngineOptionSpec> {
    vec![
        EngineOptionSpec::number("lambda", "Initial damping"),
        EngineOptionSpec::number("scale", "Damping scale factor (nu)"),
        EngineOptionSpec::number("end-threshold", "Relative parameter change for ending"),
        EngineOptionSpec::number("relative-min", "Minimum magnitude for relative changes"),
        EngineOptionSpec::integer("max-tries", "Maximum number of damping increases per iteration"),
    ]
}

/// Marquardt's algorithm with simultaneous λ and λ/ν trial steps.
pub struct QSoasEngine {
    base: EngineBase,
    parameters: Array1<f64>,
    gradient: Array1<f64>,
    jtj: Option<Array2<f64>>,
    last_residuals: f64,
    /// Consecutive iterations in which λ was lowered.
    successes: usize,

    lambda: f64,
    initial_lambda: f64,
    scale: f64,
    end_threshold: f64,
    relative_min: f64,
    max_tries: usize,
}

fn failed_trial(e: &FitError) -> bool {
    e.is_recoverable() || matches!(e, FitError::Numerical(_))
}

impl QSoasEngine {
    pub fn new(context: Arc<FitContext>) -> Self {
        Self {
            base: EngineBase::new(context),
            parameters: Array1::zeros(0),
            gradient: Array1::zeros(0),
            jtj: None,
            last_residuals: f64::NAN,
            successes: 0,
            lambda: 1e-2,
            initial_lambda: 1e-2,
            scale: 2.0,
            end_threshold: 1e-5,
            relative_min: 1e-3,
            max_tries: 30,
        }
    }

    /// Current damping.
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Solves `(JᵗJ + l I) δ = -Jᵗf` and evaluates the residuals at the
    /// resulting point.
    fn trial_step(&self, l: f64) -> Result<(Array1<f64>, f64)> {
        let jtj = self
            .jtj
            .as_ref()
            .ok_or_else(|| FitError::InvalidState("no Jacobian for the trial step".into()))?;
        let mut cur = jtj.clone();
        for i in 0..cur.nrows() {
            cur[[i, i]] += l;
        }
        let delta = solve_lu(&cur, &self.gradient)?;
        let params = &self.parameters + &delta;
        let f = self.base.context.f(&params)?;
        Ok((params, sum_of_squares(&f)))
    }

    fn step(&mut self) -> Result<IterationStatus> {
        let (function, jacobian) = self.base.context.fdf(&self.parameters)?;
        let cur_squares = sum_of_squares(&function);
        self.last_residuals = cur_squares.sqrt();
        // the residuals are model - data, hence the sign
        self.gradient = jacobian.compute_gradient(&function, -1.0);
        self.jtj = Some(jacobian.compute_jtj());

        let mut tries = 0;
        loop {
            let trials = match self.trial_step(self.lambda) {
                Ok(first) => match self.trial_step(self.lambda / self.scale) {
                    Ok(second) => Some((first, second)),
                    Err(e) if failed_trial(&e) => None,
                    Err(e) => return Err(e),
                },
                Err(e) if failed_trial(&e) => {
                    self.lambda *= self.scale;
                    None
                }
                Err(e) => return Err(e),
            };

            let accepted = match trials {
                Some((_, (p2, ns2))) if ns2 < cur_squares => {
                    let fact = (1.0 + 0.5 * self.successes as f64).min(10.0);
                    self.lambda /= self.scale.powf(fact);
                    self.successes += 1;
                    Some((p2, ns2))
                }
                Some(((p1, ns), _)) if ns <= cur_squares => Some((p1, ns)),
                _ => None,
            };

            let Some((new_params, new_squares)) = accepted else {
                tries += 1;
                if tries > self.max_tries {
                    return Err(FitError::Numerical(format!(
                        "failed to find a suitable step after {} tries",
                        tries
                    )));
                }
                self.lambda *= self.scale;
                self.successes = 0;
                log::trace!("qsoas: step rejected, lambda = {:e}", self.lambda);
                continue;
            };

            let delta = &new_params - &self.parameters;
            self.parameters = new_params;
            self.last_residuals = new_squares.sqrt();
            log::debug!(
                "qsoas iteration {}: residuals {:e}, lambda {:e}",
                self.base.iterations,
                self.last_residuals,
                self.lambda
            );

            let moving = delta
                .iter()
                .zip(self.parameters.iter())
                .any(|(dp, p)| dp.abs() / (self.relative_min + p.abs()) > self.end_threshold);
            return Ok(if moving {
                IterationStatus::Continue
            } else {
                IterationStatus::Success
            });
        }
    }
}

impl FitEngine for QSoasEngine {
    fn name(&self) -> &'static str {
        "qsoas"
    }

    fn initialize(&mut self, initial_guess: &[f64]) -> Result<()> {
        self.parameters = self.base.pack(initial_guess)?;
        self.last_residuals = self.base.context.residual_norm(&self.parameters)?;
        self.gradient = Array1::zeros(self.parameters.len());
        self.jtj = None;
        self.successes = 0;
        self.lambda = self.initial_lambda;
        self.base.initialized();
        Ok(())
    }

    fn iterate(&mut self) -> Result<IterationStatus> {
        self.base.begin_iteration()?;
        let outcome = self.step();
        self.base.finish_iteration(outcome)
    }

    fn current_parameters(&self) -> &Array1<f64> {
        &self.parameters
    }

    fn residuals(&self) -> f64 {
        self.last_residuals
    }

    fn compute_covariance_matrix(&mut self) -> Result<Array2<f64>> {
        match &self.jtj {
            Some(jtj) => invert_svd(jtj, self.base.context.svd_threshold()),
            None => super::covariance_at(&self.base.context, &self.parameters),
        }
    }

    fn recompute_jacobian(&mut self) -> Result<()> {
        let (function, jacobian) = self.base.context.fdf(&self.parameters)?;
        self.last_residuals = sum_of_squares(&function).sqrt();
        self.gradient = jacobian.compute_gradient(&function, -1.0);
        self.jtj = Some(jacobian.compute_jtj());
        Ok(())
    }

    fn state(&self) -> EngineState {
        self.base.state
    }

    fn iterations(&self) -> usize {
        self.base.iterations
    }

    fn engine_options(&self) -> EngineOptions {
        EngineOptions::new()
            .with("lambda", self.initial_lambda)
            .with("scale", self.scale)
            .with("end-threshold", self.end_threshold)
            .with("relative-min", self.relative_min)
            .with("max-tries", self.max_tries as f64)
    }

    fn set_engine_options(&mut self, options: &EngineOptions) -> Result<()> {
        options.validate(&qsoas_options())?;
        if let Some(scale) = options.get("scale") {
            if scale <= 1.0 {
                return Err(FitError::InvalidOption(format!(
                    "scale must be greater than 1, got {}",
                    scale
                )));
            }
        }
        options.update("lambda", &mut self.initial_lambda);
        options.update("scale", &mut self.scale);
        options.update("end-threshold", &mut self.end_threshold);
        options.update("relative-min", &mut self.relative_min);
        options.update_usize("max-tries", &mut self.max_tries);
        self.lambda = self.initial_lambda;
        Ok(())
    }
}
