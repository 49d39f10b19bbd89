//! Polynomial models.
//!
//! f(x) = c0 + c1*x + c2*x^2 + ... + cn*x^n

use crate::data::Dataset;
use crate::error::{FitError, Result};
use crate::model::ModelFunction;
use crate::parameters::ParameterDefinition;
use crate::utils::solve_lu;
use ndarray::{Array1, Array2};

/// A polynomial of arbitrary degree.
///
/// Parameters are named `{prefix}c0` to `{prefix}cN`, lowest order first.
#[derive(Debug, Clone)]
pub struct PolynomialModel {
    prefix: String,
    degree: usize,
}

impl PolynomialModel {
    pub fn new(prefix: &str, degree: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            degree,
        }
    }

    pub fn degree(&self) -> usize {
        self.degree
    }
}

/// Horner evaluation, `coefficients` lowest order first.
fn horner(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// Linear least-squares polynomial through the data, through the normal
/// equations. `None` when the system is singular.
fn least_squares(x: &Array1<f64>, y: &Array1<f64>, degree: usize) -> Option<Vec<f64>> {
    let terms = degree + 1;
    if x.len() < terms {
        return None;
    }
    let vandermonde = Array2::from_shape_fn((x.len(), terms), |(i, j)| x[i].powi(j as i32));
    let normal = vandermonde.t().dot(&vandermonde);
    let rhs = vandermonde.t().dot(y);
    solve_lu(&normal, &rhs).ok().map(|c| c.to_vec())
}

impl ModelFunction for PolynomialModel {
    fn parameters(&self) -> Vec<ParameterDefinition> {
        (0..=self.degree)
            .map(|i| ParameterDefinition::new(&format!("{}c{}", self.prefix, i)))
            .collect()
    }

    fn evaluate(&self, params: &[f64], dataset: &dyn Dataset, target: &mut [f64]) -> Result<()> {
        if params.len() != self.degree + 1 {
            return Err(FitError::Structural(format!(
                "polynomial of degree {} expects {} parameters, got {}",
                self.degree,
                self.degree + 1,
                params.len()
            )));
        }
        for (t, &x) in target.iter_mut().zip(dataset.x().iter()) {
            *t = horner(params, x);
        }
        Ok(())
    }

    fn initial_guess(&self, dataset: &dyn Dataset) -> Vec<f64> {
        least_squares(dataset.x(), dataset.y(), self.degree)
            .unwrap_or_else(|| vec![0.0; self.degree + 1])
    }
}

/// y = slope * x + intercept
#[derive(Debug, Clone)]
pub struct LinearModel {
    prefix: String,
}

impl LinearModel {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

impl ModelFunction for LinearModel {
    fn parameters(&self) -> Vec<ParameterDefinition> {
        vec![
            ParameterDefinition::new(&format!("{}slope", self.prefix)),
            ParameterDefinition::new(&format!("{}intercept", self.prefix)),
        ]
    }

    fn evaluate(&self, params: &[f64], dataset: &dyn Dataset, target: &mut [f64]) -> Result<()> {
        let [slope, intercept] = params else {
            return Err(FitError::Structural(format!(
                "linear model expects 2 parameters, got {}",
                params.len()
            )));
        };
        for (t, &x) in target.iter_mut().zip(dataset.x().iter()) {
            *t = slope * x + intercept;
        }
        Ok(())
    }

    /// Slope and intercept of the first and last points.
    fn initial_guess(&self, dataset: &dyn Dataset) -> Vec<f64> {
        let (x, y) = (dataset.x(), dataset.y());
        match (x.first(), x.last(), y.first(), y.last()) {
            (Some(x0), Some(x1), Some(y0), Some(y1)) if x1 != x0 => {
                let slope = (y1 - y0) / (x1 - x0);
                vec![slope, y0 - slope * x0]
            }
            (_, _, Some(y0), _) => vec![0.0, *y0],
            _ => vec![1.0, 0.0],
        }
    }
}
