//! Convergence criteria of the trust-region engines.

use ndarray::Array1;
use std::collections::VecDeque;

/// Why an engine declared convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    Running,
    /// Small relative parameter step.
    ParameterConvergence,
    /// Small scaled gradient.
    GradientConvergence,
    /// Residuals barely improving over the last accepted steps.
    Stagnation,
}

impl ConvergenceStatus {
    pub fn is_converged(&self) -> bool {
        !matches!(self, ConvergenceStatus::Running)
    }
}

/// Number of accepted steps needed before stagnation is checked.
pub const STAGNATION_WINDOW: usize = 10;

#[derive(Debug, Clone)]
pub struct ConvergenceCriteria {
    /// Tolerance for the relative parameter step.
    pub xtol: f64,

    /// Tolerance for the scaled gradient.
    pub gtol: f64,

    /// Relative improvement of the sum of squares under which the fit is
    /// considered stagnant.
    pub stagnation: f64,

    /// Sums of squares of the last accepted points.
    history: VecDeque<f64>,
}

impl Default for ConvergenceCriteria {
    fn default() -> Self {
        Self {
            xtol: 1e-4,
            gtol: 1e-12,
            stagnation: 1e-4,
            history: VecDeque::with_capacity(STAGNATION_WINDOW + 1),
        }
    }
}

impl ConvergenceCriteria {
    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Records an accepted point with sum of squares `ssr`.
    pub fn push(&mut self, ssr: f64) {
        self.history.push_back(ssr);
        while self.history.len() > STAGNATION_WINDOW + 1 {
            self.history.pop_front();
        }
    }

    /// Checks the state after an accepted `step` leading to `params`.
    pub fn check(&self, params: &Array1<f64>, step: &Array1<f64>, gradient: &Array1<f64>, ssr: f64) -> ConvergenceStatus {
        if ssr == 0.0 {
            return ConvergenceStatus::GradientConvergence;
        }
        let small_step = step
            .iter()
            .zip(params.iter())
            .all(|(d, x)| d.abs() <= self.xtol * (x.abs() + self.xtol));
        if small_step {
            return ConvergenceStatus::ParameterConvergence;
        }

        let scaled_gradient = gradient
            .iter()
            .zip(params.iter())
            .map(|(g, x)| (g * x.abs().max(1.0)).abs())
            .fold(0.0, f64::max);
        if scaled_gradient <= self.gtol * ssr.max(f64::MIN_POSITIVE) {
            return ConvergenceStatus::GradientConvergence;
        }

        if self.history.len() > STAGNATION_WINDOW {
            let n = self.history.len();
            let (last, current) = (self.history[n - 2], self.history[n - 1]);
            let progress = (last - current) / current;
            if progress >= 0.0 && progress < self.stagnation {
                return ConvergenceStatus::Stagnation;
            }
        }
        ConvergenceStatus::Running
    }
}
