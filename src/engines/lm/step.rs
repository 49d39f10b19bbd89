//! Step calculation for the trust-region Levenberg-Marquardt engines.

use crate::error::Result;
use crate::utils::solve_cholesky;
use ndarray::{Array1, Array2};

/// Result of a Levenberg-Marquardt step calculation.
pub struct StepResult {
    /// The calculated step vector
    pub step: Array1<f64>,

    /// The predicted reduction of the cost `½‖f‖²`
    pub predicted_reduction: f64,
}

/// Handles step calculation for the Levenberg-Marquardt algorithm.
pub struct LmStep;

impl LmStep {
    /// Solves `(s² JᵗJ + μ D²) δ = -s Jᵗf`.
    ///
    /// `s` is the Jacobian scaling factor, raised by the engine after a
    /// step hit an invalid point; `diag` holds D².
    pub fn calculate_step(
        jtj: &Array2<f64>,
        gradient: &Array1<f64>,
        diag: &Array1<f64>,
        mu: f64,
        jacobian_scale: f64,
    ) -> Result<StepResult> {
        let s2 = jacobian_scale * jacobian_scale;
        let scaled = jtj.mapv(|v| v * s2);
        let g = gradient.mapv(|v| v * jacobian_scale);

        let mut augmented = scaled.clone();
        for i in 0..augmented.nrows() {
            augmented[[i, i]] += mu * diag[i];
        }
        let step = solve_cholesky(&augmented, &-&g)?;
        let predicted_reduction = LmStep::predicted_reduction(&scaled, &g, &step);
        Ok(StepResult {
            step,
            predicted_reduction,
        })
    }

    /// Reduction of `½‖f + Jδ‖²` compared to `½‖f‖²`.
    fn predicted_reduction(jtj: &Array2<f64>, gradient: &Array1<f64>, step: &Array1<f64>) -> f64 {
        -step.dot(gradient) - 0.5 * step.dot(&jtj.dot(step))
    }
}
