//! Matrix conversion and small dense solvers.
//!
//! Parameter vectors and Jacobians live in `ndarray` containers; the
//! decompositions come from `nalgebra`. This module converts between
//! the two and wraps the decompositions the engines need.

use crate::error::{FitError, Result};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};

/// Convert an ndarray Array2 to a nalgebra DMatrix.
pub fn ndarray_to_nalgebra(arr: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(arr.nrows(), arr.ncols(), |i, j| arr[[i, j]])
}

/// Convert a nalgebra DMatrix to an ndarray Array2.
pub fn nalgebra_to_ndarray(mat: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

/// Convert an ndarray Array1 to a nalgebra DVector.
pub fn ndarray_vec_to_nalgebra(arr: &Array1<f64>) -> DVector<f64> {
    DVector::from_iterator(arr.len(), arr.iter().copied())
}

/// Convert a nalgebra DVector to an ndarray Array1.
pub fn nalgebra_vec_to_ndarray(vec: &DVector<f64>) -> Array1<f64> {
    vec.iter().copied().collect()
}

fn check_system(a: &Array2<f64>, b: &Array1<f64>) -> Result<()> {
    if a.nrows() != a.ncols() || a.nrows() != b.len() {
        return Err(FitError::Structural(format!(
            "cannot solve a {}x{} system with a right-hand side of length {}",
            a.nrows(),
            a.ncols(),
            b.len()
        )));
    }
    if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
        return Err(FitError::Numerical(
            "non-finite values in the linear system".to_string(),
        ));
    }
    Ok(())
}

/// Solves `a x = b` for a symmetric positive definite `a`.
///
/// # Errors
///
/// Returns [`FitError::Numerical`] when `a` is not positive definite.
pub fn solve_cholesky(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
    check_system(a, b)?;
    let chol = ndarray_to_nalgebra(a).cholesky().ok_or_else(|| {
        FitError::Numerical("matrix is not positive definite".to_string())
    })?;
    Ok(nalgebra_vec_to_ndarray(&chol.solve(&ndarray_vec_to_nalgebra(b))))
}

/// Solves `a x = b` by LU decomposition with partial pivoting.
///
/// # Errors
///
/// Returns [`FitError::Numerical`] when `a` is singular.
pub fn solve_lu(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
    check_system(a, b)?;
    let x = ndarray_to_nalgebra(a)
        .lu()
        .solve(&ndarray_vec_to_nalgebra(b))
        .ok_or_else(|| FitError::Numerical("singular matrix".to_string()))?;
    let x = nalgebra_vec_to_ndarray(&x);
    if x.iter().any(|v| !v.is_finite()) {
        return Err(FitError::Numerical("singular matrix".to_string()));
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_ndarray_nalgebra_roundtrip() {
        let arr = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let mat = ndarray_to_nalgebra(&arr);
        assert_eq!(mat[(1, 0)], 4.0);
        assert_eq!(nalgebra_to_ndarray(&mat), arr);

        let v = array![1.0, -2.0];
        assert_eq!(nalgebra_vec_to_ndarray(&ndarray_vec_to_nalgebra(&v)), v);
    }

    #[test]
    fn test_solvers() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let b = array![1.0, 2.0];
        let x = solve_cholesky(&a, &b).unwrap();
        let y = solve_lu(&a, &b).unwrap();
        assert_relative_eq!(x[0], 1.0 / 11.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 7.0 / 11.0, epsilon = 1e-12);
        assert_relative_eq!(x[0], y[0], epsilon = 1e-12);
    }

    #[test]
    fn test_singular_systems() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        let b = array![1.0, 1.0];
        assert!(solve_lu(&a, &b).is_err());
        assert!(solve_cholesky(&array![[-1.0]], &array![1.0]).is_err());
        assert!(solve_lu(&array![[1.0, 0.0]], &array![1.0]).is_err());
    }
}
