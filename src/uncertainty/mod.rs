//! # Uncertainty Calculation
//!
//! This module turns the state of a converged engine into error estimates
//! for the fitted parameters. It includes:
//!
//! - SVD pseudo-inverse of JᵗJ with a relative singular value threshold
//! - Scaling by the residual variance and expansion to natural parameters
//! - Correlation matrices and standard errors
//! - Student t confidence intervals
//!
//! Fixed and formula parameters always get a zero variance here.

mod confidence;
mod covariance;

pub use covariance::{
    calculate_correlation, covariance_from_jacobian, expand_covariance, invert_svd,
    relative_errors, scale_covariance, standard_errors_from_covariance, DEFAULT_SVD_THRESHOLD,
};

pub use confidence::{confidence_factor, confidence_intervals, student_t_cdf, student_t_quantile};
