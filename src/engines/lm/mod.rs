//! Trust-region Levenberg-Marquardt engines.
//!
//! Three variants share this implementation:
//!
//! - `lm`: classic ×10/÷10 damping, no parameter scaling
//! - `lm-scaled`: classic damping with Moré scaling (D² is the running
//!   maximum of the diagonal of JᵗJ)
//! - `lm-nielsen`: Nielsen's damping update with Moré scaling
//!
//! When a trial point raises a domain error, the iteration is restarted
//! at the current point with the Jacobian multiplied by a growing factor,
//! which shortens the steps. Convergence is declared on a small relative
//! step, a small gradient, or when the residuals stagnate over the last
//! accepted steps.

mod convergence;
mod step;
mod trust_region;

pub use convergence::{ConvergenceCriteria, ConvergenceStatus, STAGNATION_WINDOW};
pub use step::{LmStep, StepResult};
pub use trust_region::{Damping, TrustRegion};

use super::{
    sum_of_squares, EngineBase, EngineOptionSpec, EngineOptions, EngineState, FitEngine,
    IterationStatus,
};
use crate::error::{FitError, Result};
use crate::fit::FitContext;
use crate::uncertainty::invert_svd;
use ndarray::{Array1, Array2};
use std::sync::Arc;

/// Factor applied to the Jacobian scale after each invalid trial point.
const RESCALE_FACTOR: f64 = 1.6;

/// Maximum number of rejected steps within one iteration.
const MAX_REJECTIONS: usize = 100;

/// The three flavours of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LmVariant {
    Unscaled,
    Scaled,
    Nielsen,
}

impl LmVariant {
    pub fn name(&self) -> &'static str {
        match self {
            LmVariant::Unscaled => "lm",
            LmVariant::Scaled => "lm-scaled",
            LmVariant::Nielsen => "lm-nielsen",
        }
    }

    fn damping(&self) -> Damping {
        match self {
            LmVariant::Nielsen => Damping::Nielsen,
            _ => Damping::Classic,
        }
    }

    fn scaled(&self) -> bool {
        !matches!(self, LmVariant::Unscaled)
    }
}

/// Option schema shared by the three variants.
pub fn lm_options() -> Vec<EngineOptionSpec> {
    vec![
        EngineOptionSpec::number("xtol", "Relative parameter step for ending"),
        EngineOptionSpec::number("gtol", "Scaled gradient for ending"),
        EngineOptionSpec::number("stagnation", "Relative improvement below which the fit stagnates"),
        EngineOptionSpec::number("damping", "Initial damping, relative to the scaled JtJ diagonal"),
        EngineOptionSpec::integer("max-rescales", "Maximum Jacobian rescales on invalid steps"),
    ]
}

pub struct LmEngine {
    base: EngineBase,
    variant: LmVariant,
    x: Array1<f64>,
    ssr: f64,
    /// Unscaled JᵗJ and Jᵗf at `x`.
    jtj: Option<Array2<f64>>,
    gradient: Array1<f64>,
    /// D², the scaling of the damping term.
    diag: Array1<f64>,
    region: TrustRegion,
    criteria: ConvergenceCriteria,
    jacobian_scale: f64,

    initial_damping: f64,
    max_rescales: usize,
}

impl LmEngine {
    pub fn new(context: Arc<FitContext>, variant: LmVariant) -> Self {
        Self {
            base: EngineBase::new(context),
            variant,
            x: Array1::zeros(0),
            ssr: f64::NAN,
            jtj: None,
            gradient: Array1::zeros(0),
            diag: Array1::zeros(0),
            region: TrustRegion::new(variant.damping(), 1e-3),
            criteria: ConvergenceCriteria::default(),
            jacobian_scale: 1.0,
            initial_damping: 1e-3,
            max_rescales: 19,
        }
    }

    pub fn variant(&self) -> LmVariant {
        self.variant
    }

    /// Evaluates the Jacobian at the current point and updates JᵗJ, the
    /// gradient and the scaling.
    fn update_jacobian(&mut self, f: &Array1<f64>) -> Result<()> {
        let jacobian = self.base.context.df_at(&self.x, f)?;
        let jtj = jacobian.compute_jtj();
        self.gradient = jacobian.compute_gradient(f, 1.0);
        if self.variant.scaled() {
            for i in 0..self.diag.len() {
                self.diag[i] = self.diag[i].max(jtj[[i, i]]);
            }
        }
        self.jtj = Some(jtj);
        Ok(())
    }

    /// Restarts the solver state at the current point.
    fn reset(&mut self) -> Result<()> {
        let f = self.base.context.f(&self.x)?;
        self.ssr = sum_of_squares(&f);
        let n = self.x.len();
        self.diag = if self.variant.scaled() {
            Array1::zeros(n)
        } else {
            Array1::ones(n)
        };
        self.update_jacobian(&f)?;
        if self.variant.scaled() {
            // parameters with no effect keep a unit scale
            self.diag.mapv_inplace(|d| if d > 0.0 { d } else { 1.0 });
        }
        let s2 = self.jacobian_scale * self.jacobian_scale;
        let ratio = match &self.jtj {
            Some(jtj) => (0..n)
                .map(|i| s2 * jtj[[i, i]] / self.diag[i])
                .fold(0.0, f64::max),
            None => 1.0,
        };
        let mu = self.initial_damping * if ratio > 0.0 { ratio } else { 1.0 };
        self.region.reset(mu);
        self.criteria.clear();
        Ok(())
    }

    /// Damped steps until one is accepted.
    fn solver_iteration(&mut self) -> Result<IterationStatus> {
        let jtj = self
            .jtj
            .clone()
            .ok_or_else(|| FitError::InvalidState("no Jacobian at the current point".into()))?;
        let cost = 0.5 * self.ssr;

        for _ in 0..MAX_REJECTIONS {
            let StepResult {
                step,
                predicted_reduction,
            } = LmStep::calculate_step(
                &jtj,
                &self.gradient,
                &self.diag,
                self.region.mu,
                self.jacobian_scale,
            )?;
            let trial = &self.x + &step;
            let f = self.base.context.f(&trial)?;
            let ssr = sum_of_squares(&f);
            let rho = TrustRegion::gain_ratio(cost, 0.5 * ssr, predicted_reduction);
            if !self.region.update(rho) {
                log::trace!("{}: step rejected, mu = {:e}", self.variant.name(), self.region.mu);
                continue;
            }

            self.x = trial;
            self.ssr = ssr;
            self.update_jacobian(&f)?;
            self.criteria.push(ssr);
            let status = self.criteria.check(&self.x, &step, &self.gradient, ssr);
            log::debug!(
                "{} iteration {}: residuals {:e}, mu {:e} ({:?})",
                self.variant.name(),
                self.base.iterations,
                ssr.sqrt(),
                self.region.mu,
                status
            );
            return Ok(if status.is_converged() {
                IterationStatus::Success
            } else {
                IterationStatus::Continue
            });
        }
        Err(FitError::Numerical(format!(
            "no acceptable step after {} tries",
            MAX_REJECTIONS
        )))
    }

    fn step(&mut self) -> Result<IterationStatus> {
        let mut tries = 0;
        self.jacobian_scale = 1.0;
        loop {
            match self.solver_iteration() {
                Ok(status) => {
                    if self.jacobian_scale != 1.0 {
                        // the rescaled state is not trusted past one step
                        self.jacobian_scale = 1.0;
                        self.reset()?;
                        return Ok(IterationStatus::Continue);
                    }
                    return Ok(status);
                }
                Err(e) if e.is_recoverable() => {
                    self.jacobian_scale *= RESCALE_FACTOR;
                    tries += 1;
                    if tries >= self.max_rescales {
                        return Err(e);
                    }
                    log::warn!(
                        "{}: {}, scaling the jacobian by {}",
                        self.variant.name(),
                        e,
                        self.jacobian_scale
                    );
                    self.reset()?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl FitEngine for LmEngine {
    fn name(&self) -> &'static str {
        self.variant.name()
    }

    fn initialize(&mut self, initial_guess: &[f64]) -> Result<()> {
        self.x = self.base.pack(initial_guess)?;
        self.jacobian_scale = 1.0;
        self.reset()?;
        self.base.initialized();
        Ok(())
    }

    fn iterate(&mut self) -> Result<IterationStatus> {
        self.base.begin_iteration()?;
        let outcome = self.step();
        self.base.finish_iteration(outcome)
    }

    fn current_parameters(&self) -> &Array1<f64> {
        &self.x
    }

    fn residuals(&self) -> f64 {
        self.ssr.sqrt()
    }

    fn compute_covariance_matrix(&mut self) -> Result<Array2<f64>> {
        match &self.jtj {
            Some(jtj) => invert_svd(jtj, self.base.context.svd_threshold()),
            None => super::covariance_at(&self.base.context, &self.x),
        }
    }

    fn recompute_jacobian(&mut self) -> Result<()> {
        let f = self.base.context.f(&self.x)?;
        self.ssr = sum_of_squares(&f);
        self.update_jacobian(&f)
    }

    fn state(&self) -> EngineState {
        self.base.state
    }

    fn iterations(&self) -> usize {
        self.base.iterations
    }

    fn engine_options(&self) -> EngineOptions {
        EngineOptions::new()
            .with("xtol", self.criteria.xtol)
            .with("gtol", self.criteria.gtol)
            .with("stagnation", self.criteria.stagnation)
            .with("damping", self.initial_damping)
            .with("max-rescales", self.max_rescales as f64)
    }

    fn set_engine_options(&mut self, options: &EngineOptions) -> Result<()> {
        options.validate(&lm_options())?;
        options.update("xtol", &mut self.criteria.xtol);
        options.update("gtol", &mut self.criteria.gtol);
        options.update("stagnation", &mut self.criteria.stagnation);
        options.update("damping", &mut self.initial_damping);
        options.update_usize("max-rescales", &mut self.max_rescales);
        Ok(())
    }
}
