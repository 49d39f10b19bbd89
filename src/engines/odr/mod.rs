//! Orthogonal distance regression engine.
//!
//! Wraps the batch solver of [`solver`], which knows nothing about fit
//! contexts: it calls back through a bare function pointer. The context
//! being fitted is published in the process-wide slot of [`active`] for
//! the duration of each solver call. ODR fits are therefore not
//! reentrant: running two of them at the same time from different threads
//! makes the second one fail with [`FitError::ActiveFitBusy`].

pub mod active;
pub mod solver;

pub use solver::{odr_iterate, OdrCallback, SolverControl, SolverInfo, WorkOffsets};

use super::{EngineBase, EngineOptionSpec, EngineOptions, EngineState, FitEngine, IterationStatus};
use crate::error::{FitError, Result};
use crate::fit::FitContext;
use ndarray::{Array1, Array2};
use solver::{EVAL_FUNCTION, EVAL_JACOBIAN};
use std::sync::Arc;

/// Option schema of the ODR engine.
pub fn odr_options() -> Vec<EngineOptionSpec> {
    vec![
        EngineOptionSpec::number("sstol", "Relative sum of squares reduction for ending"),
        EngineOptionSpec::number("partol", "Relative parameter change for ending"),
    ]
}

/// Bridges the solver callback to the active fit context.
fn odr_callback(
    n: usize,
    np: usize,
    beta: &[f64],
    ideval: u32,
    f: &mut [f64],
    fjacb: &mut [f64],
    istop: &mut i32,
) {
    let Some(context) = active::active_context() else {
        *istop = -1;
        return;
    };
    let x = Array1::from(beta.to_vec());
    let outcome = (|| -> Result<()> {
        let fx = context.f(&x)?;
        if ideval & EVAL_FUNCTION != 0 {
            for (t, v) in f.iter_mut().zip(fx.iter()) {
                *t = *v;
            }
        }
        if ideval & EVAL_JACOBIAN != 0 {
            let jacobian = context.df_at(&x, &fx)?;
            for col in 0..np {
                for row in 0..n {
                    fjacb[col * n + row] = jacobian.get(row, col);
                }
            }
        }
        Ok(())
    })();
    match outcome {
        Ok(()) => *istop = 0,
        Err(e) if e.is_recoverable() => *istop = 1,
        Err(e) => {
            active::record_error(e);
            *istop = -1;
        }
    }
}

pub struct OdrEngine {
    base: EngineBase,
    beta: Array1<f64>,
    work: Vec<f64>,
    offsets: WorkOffsets,
    control: SolverControl,
    /// Whether the work array holds statistics.
    solved: bool,
}

impl OdrEngine {
    pub fn new(context: Arc<FitContext>) -> Self {
        Self {
            base: EngineBase::new(context),
            beta: Array1::zeros(0),
            work: Vec::new(),
            offsets: WorkOffsets::new(0),
            control: SolverControl::default(),
            solved: false,
        }
    }

    /// Standard deviations of the optimizer-space parameters reported by
    /// the solver.
    pub fn standard_deviations(&self) -> &[f64] {
        let np = self.beta.len();
        self.work.get(self.offsets.sd..self.offsets.sd + np).unwrap_or(&[])
    }

    /// Reciprocal condition number of JᵗJ at the last iteration.
    pub fn reciprocal_condition(&self) -> f64 {
        self.work.get(self.offsets.rcond).copied().unwrap_or(f64::NAN)
    }

    fn step(&mut self) -> Result<IterationStatus> {
        let n = self.base.context.data_points();
        let guard = active::activate(Arc::clone(&self.base.context))?;
        let mut beta = self.beta.to_vec();
        let info = odr_iterate(odr_callback, n, &mut beta, &mut self.work, &self.control);
        let error = guard.take_error();
        drop(guard);
        let info = info?;

        self.beta = Array1::from(beta);
        self.solved = true;
        log::debug!(
            "odr iteration {}: wss {:e} ({:?})",
            self.base.iterations,
            self.work[self.offsets.wss],
            info
        );
        match info {
            SolverInfo::Continue => Ok(IterationStatus::Continue),
            SolverInfo::SumOfSquaresConvergence | SolverInfo::ParameterConvergence => {
                Ok(IterationStatus::Success)
            }
            SolverInfo::InvalidStart => Err(FitError::Domain(
                "the model rejected the current parameters".to_string(),
            )),
            SolverInfo::NoProgress => Err(FitError::Numerical(
                "the solver could not improve the residuals".to_string(),
            )),
            SolverInfo::Stopped => Err(error.unwrap_or_else(|| {
                FitError::Numerical("the solver was stopped".to_string())
            })),
        }
    }
}

impl FitEngine for OdrEngine {
    fn name(&self) -> &'static str {
        "odrpack"
    }

    fn initialize(&mut self, initial_guess: &[f64]) -> Result<()> {
        self.beta = self.base.pack(initial_guess)?;
        self.control.svd_threshold = self.base.context.svd_threshold();
        self.offsets = WorkOffsets::new(self.beta.len());
        self.work = vec![0.0; self.offsets.len];
        self.work[self.offsets.wss] = self.base.context.chi_square(&self.beta)?;
        self.solved = false;
        self.base.initialized();
        Ok(())
    }

    fn iterate(&mut self) -> Result<IterationStatus> {
        self.base.begin_iteration()?;
        let outcome = self.step();
        self.base.finish_iteration(outcome)
    }

    fn current_parameters(&self) -> &Array1<f64> {
        &self.beta
    }

    fn residuals(&self) -> f64 {
        self.work
            .get(self.offsets.wss)
            .map_or(f64::NAN, |wss| wss.sqrt())
    }

    fn compute_covariance_matrix(&mut self) -> Result<Array2<f64>> {
        if !self.solved {
            return super::covariance_at(&self.base.context, &self.beta);
        }
        let np = self.beta.len();
        let vcv = self.offsets.vcv;
        Ok(Array2::from_shape_fn((np, np), |(i, j)| self.work[vcv + i * np + j]))
    }

    fn state(&self) -> EngineState {
        self.base.state
    }

    fn iterations(&self) -> usize {
        self.base.iterations
    }

    fn engine_options(&self) -> EngineOptions {
        EngineOptions::new()
            .with("sstol", self.control.sstol)
            .with("partol", self.control.partol)
    }

    fn set_engine_options(&mut self, options: &EngineOptions) -> Result<()> {
        options.validate(&odr_options())?;
        options.update("sstol", &mut self.control.sstol);
        options.update("partol", &mut self.control.partol);
        Ok(())
    }
}
