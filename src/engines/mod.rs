//! # Fit Engines
//!
//! An engine iterates on the optimizer-space parameters of a
//! [`FitContext`](crate::fit::FitContext) until a convergence criterion of
//! its own is met. All engines share the [`FitEngine`] contract so the
//! driver can swap them by name through the [`EngineRegistry`].
//!
//! Every engine goes through the same states:
//! `Uninitialized -> Initialized -> Iterating -> (Converged | Failed)`.
//! After a failure, [`FitEngine::current_parameters`] still holds the best
//! point reached, so a caller can switch engines and resume from there.

pub mod lm;
#[cfg(feature = "odr")]
pub mod odr;
pub mod options;
pub mod pso;
pub mod qsoas;
pub mod registry;
pub mod simplex;
pub mod stored;

pub use options::{EngineOptionSpec, EngineOptions, OptionKind};
pub use registry::{default_registry, EngineFactoryItem, EngineRegistry};
pub use stored::StoredParameters;

use crate::error::{FitError, Result};
use crate::fit::FitContext;
use ndarray::{Array1, Array2};
use std::fmt;
use std::sync::Arc;

/// Outcome of a successful iteration. A failed iteration is an `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationStatus {
    /// Not converged yet, call again.
    Continue,
    /// The engine's convergence criterion is met.
    Success,
}

/// Where an engine stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Uninitialized,
    Initialized,
    Iterating,
    Converged,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Initialized => "initialized",
            EngineState::Iterating => "iterating",
            EngineState::Converged => "converged",
            EngineState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// The contract shared by all fit engines.
pub trait FitEngine: Send {
    /// Registered name of the engine.
    fn name(&self) -> &'static str;

    /// Packs `initial_guess` (natural parameters, dataset after dataset)
    /// and sets up the engine state. `current_parameters` is valid right
    /// after this returns.
    fn initialize(&mut self, initial_guess: &[f64]) -> Result<()>;

    /// Performs exactly one optimization step.
    ///
    /// An `Err` means FAILURE: this engine cannot go on. Domain errors at
    /// trial points are handled inside and never surface here unless the
    /// engine's retry counters are exhausted.
    fn iterate(&mut self) -> Result<IterationStatus>;

    /// The current (best) optimizer-space parameters.
    fn current_parameters(&self) -> &Array1<f64>;

    /// Norm of the weighted residual vector at the current parameters,
    /// that is the square root of the sum of squares.
    fn residuals(&self) -> f64;

    /// Unscaled covariance `(JᵗJ)⁻¹` at the current parameters, in
    /// optimizer space.
    fn compute_covariance_matrix(&mut self) -> Result<Array2<f64>>;

    /// Forces a fresh Jacobian evaluation at the current parameters, for
    /// engines that keep a stale one between steps.
    fn recompute_jacobian(&mut self) -> Result<()> {
        Ok(())
    }

    fn state(&self) -> EngineState;

    /// Iterations performed since `initialize`.
    fn iterations(&self) -> usize;

    /// Current values of the engine options.
    fn engine_options(&self) -> EngineOptions;

    /// Changes engine options.
    ///
    /// # Errors
    ///
    /// [`FitError::InvalidOption`] for unknown options or bad values.
    fn set_engine_options(&mut self, options: &EngineOptions) -> Result<()>;
}

/// Bookkeeping shared by the engine implementations.
#[derive(Debug)]
pub(crate) struct EngineBase {
    pub context: Arc<FitContext>,
    pub state: EngineState,
    pub iterations: usize,
}

impl EngineBase {
    pub fn new(context: Arc<FitContext>) -> Self {
        Self {
            context,
            state: EngineState::Uninitialized,
            iterations: 0,
        }
    }

    pub fn initialized(&mut self) {
        self.state = EngineState::Initialized;
        self.iterations = 0;
    }

    /// Checks the engine may iterate and counts the iteration.
    pub fn begin_iteration(&mut self) -> Result<()> {
        match self.state {
            EngineState::Uninitialized => Err(FitError::InvalidState(
                "engine iterated before initialization".to_string(),
            )),
            EngineState::Failed => Err(FitError::InvalidState(
                "engine iterated after a failure".to_string(),
            )),
            _ => {
                self.state = EngineState::Iterating;
                self.iterations += 1;
                Ok(())
            }
        }
    }

    /// Records the outcome of an iteration.
    pub fn finish_iteration(&mut self, outcome: Result<IterationStatus>) -> Result<IterationStatus> {
        match &outcome {
            Ok(IterationStatus::Success) => self.state = EngineState::Converged,
            Ok(IterationStatus::Continue) => self.state = EngineState::Iterating,
            Err(e) => {
                log::debug!("engine failed: {}", e);
                self.state = EngineState::Failed;
            }
        }
        outcome
    }

    /// Packs a natural-space guess.
    pub fn pack(&self, initial_guess: &[f64]) -> Result<Array1<f64>> {
        self.context.pack(initial_guess)
    }
}

/// Sum of squares of a residual vector.
pub(crate) fn sum_of_squares(f: &Array1<f64>) -> f64 {
    f.iter().map(|v| v * v).sum()
}

/// Covariance from a fresh Jacobian at `x`, for engines that have none.
pub(crate) fn covariance_at(context: &FitContext, x: &Array1<f64>) -> Result<Array2<f64>> {
    let jacobian = context.df(x)?;
    crate::uncertainty::covariance_from_jacobian(&jacobian, context.svd_threshold())
}
