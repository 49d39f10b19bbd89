//! Datasets seen by the fitting core.
//!
//! The fitting code only ever reads datasets: X and Y values, optional
//! per-point standard errors and a buffer-level weight. Loading and
//! storing datasets is the business of the caller.

use crate::error::{FitError, Result};
use ndarray::Array1;

/// Read-only access to one dataset.
///
/// Implementations must be safe to share between the worker threads that
/// evaluate Jacobian columns.
pub trait Dataset: Send + Sync {
    /// Name used in log messages and trajectories.
    fn name(&self) -> &str {
        ""
    }

    /// X values.
    fn x(&self) -> &Array1<f64>;

    /// Y values, same length as `x`.
    fn y(&self) -> &Array1<f64>;

    /// Per-point standard errors, if known.
    fn errors(&self) -> Option<&Array1<f64>> {
        None
    }

    /// Buffer-level weight, 1 by default.
    fn weight(&self) -> f64 {
        1.0
    }

    /// Number of points.
    fn len(&self) -> usize {
        self.x().len()
    }

    /// Whether the dataset has no points.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An owned dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSet {
    name: String,
    x: Array1<f64>,
    y: Array1<f64>,
    errors: Option<Array1<f64>>,
    weight: f64,
}

impl DataSet {
    /// Create a dataset from X and Y values.
    ///
    /// # Errors
    ///
    /// Returns a structural error when the lengths differ.
    pub fn new(x: Array1<f64>, y: Array1<f64>) -> Result<Self> {
        if x.len() != y.len() {
            return Err(FitError::Structural(format!(
                "dataset has {} X values but {} Y values",
                x.len(),
                y.len()
            )));
        }
        Ok(Self {
            name: String::new(),
            x,
            y,
            errors: None,
            weight: 1.0,
        })
    }

    /// Build a dataset by evaluating `f` on the given X values.
    pub fn from_fn(x: Array1<f64>, f: impl Fn(f64) -> f64) -> Self {
        let y = x.mapv(f);
        Self {
            name: String::new(),
            x,
            y,
            errors: None,
            weight: 1.0,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Attach per-point standard errors.
    ///
    /// # Errors
    ///
    /// Returns a structural error when the length does not match or when
    /// an error is not strictly positive.
    pub fn with_errors(mut self, errors: Array1<f64>) -> Result<Self> {
        if errors.len() != self.x.len() {
            return Err(FitError::Structural(format!(
                "dataset has {} points but {} errors",
                self.x.len(),
                errors.len()
            )));
        }
        if errors.iter().any(|e| !(*e > 0.0) || !e.is_finite()) {
            return Err(FitError::Structural(
                "standard errors must be finite and positive".to_string(),
            ));
        }
        self.errors = Some(errors);
        Ok(self)
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

impl Dataset for DataSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn x(&self) -> &Array1<f64> {
        &self.x
    }

    fn y(&self) -> &Array1<f64> {
        &self.y
    }

    fn errors(&self) -> Option<&Array1<f64>> {
        self.errors.as_ref()
    }

    fn weight(&self) -> f64 {
        self.weight
    }
}
