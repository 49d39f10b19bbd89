//! A batch weighted least-squares solver driven through a callback, in the
//! calling convention of classic orthogonal distance regression codes.
//!
//! The caller owns every buffer: the parameters `beta` and a flat work
//! array whose layout is described by [`WorkOffsets`]. Each call to
//! [`odr_iterate`] performs one damped Gauss-Newton iteration and leaves
//! the standard deviations, the unscaled covariance, the weighted sum of
//! squares and the reciprocal condition number at fixed offsets of the
//! work array.
//!
//! The callback receives `ideval`: bit 0 asks for the residuals, bit 1
//! for the Jacobian (column-major, `n` rows). It sets `istop` to 0 when
//! the point is acceptable, to a positive value to reject the point, and
//! to a negative value to stop the solver.

use crate::error::Result;
use crate::uncertainty::{invert_svd, DEFAULT_SVD_THRESHOLD};
use crate::utils::{ndarray_to_nalgebra, solve_cholesky};
use ndarray::{Array1, Array2};

/// The model callback. No user data is passed along.
pub type OdrCallback = fn(
    n: usize,
    np: usize,
    beta: &[f64],
    ideval: u32,
    f: &mut [f64],
    fjacb: &mut [f64],
    istop: &mut i32,
);

/// Ask the callback for residuals.
pub const EVAL_FUNCTION: u32 = 1;
/// Ask the callback for the Jacobian.
pub const EVAL_JACOBIAN: u32 = 2;

/// Damping increases before an iteration gives up.
const MAX_DAMPING_TRIES: usize = 20;

/// Fixed offsets into the work array, for `np` parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkOffsets {
    /// Standard deviations of the parameters (`np` values).
    pub sd: usize,
    /// Unscaled covariance matrix, row-major (`np * np` values).
    pub vcv: usize,
    /// Weighted sum of squared residuals.
    pub wss: usize,
    /// Reciprocal condition number of JᵗJ.
    pub rcond: usize,
    /// Levenberg damping carried between iterations.
    pub lambda: usize,
    /// Total length of the work array.
    pub len: usize,
}

impl WorkOffsets {
    pub fn new(np: usize) -> Self {
        let sd = 0;
        let vcv = sd + np;
        let wss = vcv + np * np;
        let rcond = wss + 1;
        let lambda = rcond + 1;
        Self {
            sd,
            vcv,
            wss,
            rcond,
            lambda,
            len: lambda + 1,
        }
    }
}

/// Stopping tolerances.
#[derive(Debug, Clone, Copy)]
pub struct SolverControl {
    /// Relative reduction of the sum of squares.
    pub sstol: f64,
    /// Relative parameter change.
    pub partol: f64,
    /// Damping of the first iteration, relative to the JᵗJ diagonal.
    pub initial_lambda: f64,
    /// Relative singular value threshold of the covariance pseudo-inverse.
    pub svd_threshold: f64,
}

impl Default for SolverControl {
    fn default() -> Self {
        Self {
            sstol: 1e-8,
            partol: 1e-8,
            initial_lambda: 1e-3,
            svd_threshold: DEFAULT_SVD_THRESHOLD,
        }
    }
}

/// Outcome of one solver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverInfo {
    /// Not converged yet.
    Continue,
    /// The sum of squares stopped decreasing.
    SumOfSquaresConvergence,
    /// The parameters stopped moving.
    ParameterConvergence,
    /// The callback rejected the current point.
    InvalidStart,
    /// No damping gave a better point.
    NoProgress,
    /// The callback asked to stop.
    Stopped,
}

fn evaluate(
    fcn: OdrCallback,
    n: usize,
    beta: &[f64],
    ideval: u32,
    f: &mut [f64],
    fjacb: &mut [f64],
) -> i32 {
    let mut istop = 0;
    fcn(n, beta.len(), beta, ideval, f, fjacb, &mut istop);
    istop
}

fn sum_of_squares(f: &[f64]) -> f64 {
    f.iter().map(|v| v * v).sum()
}

/// Fills the statistics part of the work array from JᵗJ.
fn store_statistics(
    jtj: &Array2<f64>,
    wss: f64,
    n: usize,
    work: &mut [f64],
    offsets: &WorkOffsets,
    threshold: f64,
) -> Result<()> {
    let np = jtj.nrows();
    let vcv = invert_svd(jtj, threshold)?;
    let dof = n.saturating_sub(np).max(1) as f64;
    for i in 0..np {
        for j in 0..np {
            work[offsets.vcv + i * np + j] = vcv[[i, j]];
        }
        work[offsets.sd + i] = (vcv[[i, i]].max(0.0) * wss / dof).sqrt();
    }
    work[offsets.wss] = wss;

    let singular = ndarray_to_nalgebra(jtj).singular_values();
    let max = singular.iter().cloned().fold(0.0, f64::max);
    let min = singular.iter().cloned().fold(f64::INFINITY, f64::min);
    work[offsets.rcond] = if max > 0.0 && min.is_finite() { min / max } else { 0.0 };
    Ok(())
}

/// Performs one iteration from `beta`, updating `beta` and `work`.
///
/// `work` must have at least `WorkOffsets::new(beta.len()).len` values;
/// a zero damping slot means a first iteration.
///
/// # Errors
///
/// Fails when the covariance matrix cannot be computed.
pub fn odr_iterate(
    fcn: OdrCallback,
    n: usize,
    beta: &mut [f64],
    work: &mut [f64],
    control: &SolverControl,
) -> Result<SolverInfo> {
    let np = beta.len();
    let offsets = WorkOffsets::new(np);
    if work.len() < offsets.len {
        return Ok(SolverInfo::Stopped);
    }
    let threshold = control.svd_threshold;

    let mut f = vec![0.0; n];
    let mut fjacb = vec![0.0; n * np];
    match evaluate(fcn, n, beta, EVAL_FUNCTION | EVAL_JACOBIAN, &mut f, &mut fjacb) {
        0 => {}
        s if s > 0 => return Ok(SolverInfo::InvalidStart),
        _ => return Ok(SolverInfo::Stopped),
    }
    let wss = sum_of_squares(&f);
    let jacobian = Array2::from_shape_fn((n, np), |(i, j)| fjacb[j * n + i]);
    let jtj = jacobian.t().dot(&jacobian);
    let gradient = jacobian.t().dot(&Array1::from(f.clone()));

    let mut lambda = work[offsets.lambda];
    if lambda <= 0.0 {
        let max_diag = (0..np).map(|i| jtj[[i, i]]).fold(0.0, f64::max);
        lambda = control.initial_lambda * if max_diag > 0.0 { max_diag } else { 1.0 };
    }

    let mut trial_f = vec![0.0; n];
    let mut unused = vec![0.0; 0];
    for _ in 0..MAX_DAMPING_TRIES {
        let mut a = jtj.clone();
        for i in 0..np {
            a[[i, i]] += lambda * jtj[[i, i]].max(1e-300);
        }
        let step = match solve_cholesky(&a, &-&gradient) {
            Ok(s) => s,
            Err(_) => {
                lambda *= 10.0;
                continue;
            }
        };
        let small_step = step
            .iter()
            .zip(beta.iter())
            .all(|(s, b)| s.abs() <= control.partol * (b.abs() + control.partol));
        if small_step {
            work[offsets.lambda] = lambda;
            store_statistics(&jtj, wss, n, work, &offsets, threshold)?;
            return Ok(SolverInfo::ParameterConvergence);
        }
        let trial: Vec<f64> = beta.iter().zip(step.iter()).map(|(b, s)| b + s).collect();
        match evaluate(fcn, n, &trial, EVAL_FUNCTION, &mut trial_f, &mut unused) {
            0 => {}
            s if s > 0 => {
                lambda *= 10.0;
                continue;
            }
            _ => return Ok(SolverInfo::Stopped),
        }
        let trial_wss = sum_of_squares(&trial_f);
        if trial_wss > wss {
            lambda *= 10.0;
            continue;
        }

        let small_reduction = wss - trial_wss <= control.sstol * wss;
        beta.copy_from_slice(&trial);
        work[offsets.lambda] = (lambda * 0.1).max(1e-300);
        store_statistics(&jtj, trial_wss, n, work, &offsets, threshold)?;
        return Ok(if small_reduction {
            SolverInfo::SumOfSquaresConvergence
        } else {
            SolverInfo::Continue
        });
    }
    work[offsets.lambda] = lambda;
    store_statistics(&jtj, wss, n, work, &offsets, threshold)?;
    Ok(SolverInfo::NoProgress)
}
