//! # Covariance Matrix Calculations
//!
//! This module provides functions for calculating and manipulating covariance
//! matrices from Jacobian matrices in nonlinear least-squares fits.

use crate::error::{FitError, Result};
use crate::fit::FitContext;
use crate::jacobian::SparseJacobian;
use crate::utils::{nalgebra_to_ndarray, ndarray_to_nalgebra};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2};

/// Default relative singular value threshold.
pub const DEFAULT_SVD_THRESHOLD: f64 = 1e-7;

/// Pseudo-inverse of a symmetric matrix by singular value decomposition.
///
/// Singular values below `threshold` times the largest one are treated
/// as zero, which keeps rank-deficient systems (for instance a parameter
/// with no effect on the residuals) from blowing up.
pub fn invert_svd(matrix: &Array2<f64>, threshold: f64) -> Result<Array2<f64>> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(FitError::Structural(format!(
            "cannot invert a {}x{} matrix",
            rows, cols
        )));
    }
    if rows == 0 {
        return Ok(Array2::zeros((0, 0)));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(FitError::Numerical(
            "non-finite values in the matrix to invert".to_string(),
        ));
    }

    let m = ndarray_to_nalgebra(matrix);
    let svd = m.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| FitError::Numerical("SVD did not produce U".to_string()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| FitError::Numerical("SVD did not produce V".to_string()))?;
    let s = svd.singular_values;

    let s_max = s.iter().cloned().fold(0.0, f64::max);
    let inverse = s.map(|v| if v > threshold * s_max && v > 0.0 { 1.0 / v } else { 0.0 });

    // V Σ⁺ Uᵗ
    let pseudo = v_t.transpose() * DMatrix::from_diagonal(&inverse) * u.transpose();
    Ok(nalgebra_to_ndarray(&pseudo))
}

/// Unscaled covariance `(JᵗJ)⁻¹` in optimizer space.
pub fn covariance_from_jacobian(jacobian: &SparseJacobian, threshold: f64) -> Result<Array2<f64>> {
    invert_svd(&jacobian.compute_jtj(), threshold)
}

/// Scales an unscaled covariance by the residual variance
/// `residuals² / dof`, `residuals` being the norm of the residual vector.
pub fn scale_covariance(covariance: &Array2<f64>, residuals: f64, dof: usize) -> Array2<f64> {
    let variance = residuals * residuals / dof.max(1) as f64;
    covariance.mapv(|v| v * variance)
}

/// Expands an optimizer-space covariance to the natural parameters of
/// every dataset.
///
/// Free parameters with a bijection get the first-order propagation
/// through its derivative. Global parameters appear in the slot of every
/// dataset. Fixed and formula parameters have zero rows and columns.
pub fn expand_covariance(
    context: &FitContext,
    parameters: &Array1<f64>,
    covariance: &Array2<f64>,
) -> Array2<f64> {
    let nb_ds = context.dataset_count();
    let n = context.parameters_per_dataset();
    let full_len = nb_ds * n;
    let mut full = Array2::zeros((full_len, full_len));

    let free = context.free_parameter_list();
    let slots: Vec<(Vec<usize>, f64)> = free
        .iter()
        .enumerate()
        .map(|(fi, p)| {
            let targets = p
                .target_datasets(nb_ds)
                .map(|ds| ds * n + p.index)
                .collect();
            let factor = p.bijection().map_or(1.0, |b| b.derivative(parameters[fi]));
            (targets, factor)
        })
        .collect();

    for (i, (targets_i, factor_i)) in slots.iter().enumerate() {
        for (j, (targets_j, factor_j)) in slots.iter().enumerate() {
            let value = covariance[[i, j]] * factor_i * factor_j;
            for &ti in targets_i {
                for &tj in targets_j {
                    full[[ti, tj]] = value;
                }
            }
        }
    }
    full
}

/// Calculate correlation matrix from covariance matrix.
///
/// The correlation matrix is calculated as:
///   correl[i,j] = covar[i,j] / sqrt(covar[i,i] * covar[j,j])
///
/// Rows of parameters with zero variance are zero, except for the
/// diagonal which is always 1.
pub fn calculate_correlation(covar: &Array2<f64>) -> Array2<f64> {
    let n = covar.nrows();
    let mut correl = Array2::zeros((n, n));

    for i in 0..n {
        for j in 0..n {
            if i == j {
                correl[[i, j]] = 1.0;
            } else {
                let denom = (covar[[i, i]] * covar[[j, j]]).sqrt();
                if denom > 0.0 {
                    correl[[i, j]] = covar[[i, j]] / denom;
                }
            }
        }
    }

    correl
}

/// Extract standard errors from the covariance matrix.
///
/// Standard errors are the square roots of the diagonal elements
/// of the covariance matrix.
pub fn standard_errors_from_covariance(covar: &Array2<f64>) -> Array1<f64> {
    covar.diag().mapv(|v| v.max(0.0).sqrt())
}

/// Standard errors relative to the parameter values. Zero values give
/// an infinite relative error unless the error is zero too.
pub fn relative_errors(errors: &Array1<f64>, values: &[f64]) -> Vec<f64> {
    errors
        .iter()
        .zip(values)
        .map(|(&e, &v)| {
            if e == 0.0 {
                0.0
            } else if v == 0.0 {
                f64::INFINITY
            } else {
                (e / v).abs()
            }
        })
        .collect()
}
