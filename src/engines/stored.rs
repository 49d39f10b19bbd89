//! Snapshots of evaluated positions, for derivative-free engines.

use crate::error::Result;
use crate::fit::FitContext;
use ndarray::Array1;
use std::cmp::Ordering;

/// An optimizer-space position and its sum of squared residuals.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredParameters {
    pub parameters: Array1<f64>,
    pub residuals: f64,
}

impl StoredParameters {
    pub fn new(parameters: Array1<f64>, residuals: f64) -> Self {
        Self {
            parameters,
            residuals,
        }
    }

    /// Evaluates the residuals of `context` at `parameters`.
    ///
    /// Fails with the model's domain error for invalid positions.
    pub fn evaluate(context: &FitContext, parameters: Array1<f64>) -> Result<Self> {
        let f = context.f(&parameters)?;
        let residuals = super::sum_of_squares(&f);
        Ok(Self::new(parameters, residuals))
    }

    /// Orders by residuals; NaN sorts last.
    pub fn cmp_residuals(&self, other: &Self) -> Ordering {
        match (self.residuals.is_nan(), other.residuals.is_nan()) {
            (false, false) => self.residuals.total_cmp(&other.residuals),
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (true, true) => Ordering::Equal,
        }
    }

    pub fn is_better_than(&self, other: &Self) -> bool {
        self.cmp_residuals(other) == Ordering::Less
    }
}

/// Sorts from best to worst.
pub fn sort_by_residuals(list: &mut [StoredParameters]) {
    list.sort_by(|a, b| a.cmp_residuals(b));
}
