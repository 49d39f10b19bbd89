//! Exponential decay model.
//!
//! f(x) = amplitude * exp(-rate * (x - x0)) + baseline
//!
//! where `x0` is the first abscissa of the dataset.

use crate::data::Dataset;
use crate::error::{FitError, Result};
use crate::model::ModelFunction;
use crate::parameters::ParameterDefinition;

/// An exponential decay towards a baseline.
///
/// A negative rate is outside the domain of the model: evaluation then
/// fails with [`FitError::Domain`], which engines treat as a rejected
/// trial point.
#[derive(Debug, Clone)]
pub struct ExponentialDecayModel {
    prefix: String,
}

impl ExponentialDecayModel {
    /// Create a new model whose parameter names start with `prefix`.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

impl ModelFunction for ExponentialDecayModel {
    fn parameters(&self) -> Vec<ParameterDefinition> {
        ["amplitude", "rate", "baseline"]
            .iter()
            .map(|n| ParameterDefinition::new(&format!("{}{}", self.prefix, n)))
            .collect()
    }

    fn evaluate(&self, params: &[f64], dataset: &dyn Dataset, target: &mut [f64]) -> Result<()> {
        let [amplitude, rate, baseline] = params else {
            return Err(FitError::Structural(format!(
                "exponential decay expects 3 parameters, got {}",
                params.len()
            )));
        };
        if *rate < 0.0 {
            return Err(FitError::Domain(format!("negative rate: {}", rate)));
        }
        let x = dataset.x();
        let x0 = x.first().copied().unwrap_or(0.0);
        for (t, &xi) in target.iter_mut().zip(x.iter()) {
            *t = amplitude * (-rate * (xi - x0)).exp() + baseline;
        }
        Ok(())
    }

    /// Baseline from the last point, amplitude from the first, and a rate
    /// of three lifetimes over the x range.
    fn initial_guess(&self, dataset: &dyn Dataset) -> Vec<f64> {
        let (x, y) = (dataset.x(), dataset.y());
        let (Some(&first), Some(&last)) = (y.first(), y.last()) else {
            return vec![1.0, 1.0, 0.0];
        };
        let span = match (x.first(), x.last()) {
            (Some(a), Some(b)) if (b - a).abs() > 0.0 => (b - a).abs(),
            _ => 1.0,
        };
        vec![first - last, 3.0 / span, last]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataSet;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_evaluate() {
        let model = ExponentialDecayModel::new("");
        let ds = DataSet::new(array![1.0, 2.0], array![0.0, 0.0]).unwrap();
        let mut out = [0.0; 2];
        model.evaluate(&[2.0, 0.5, 1.0], &ds, &mut out).unwrap();
        assert_relative_eq!(out[0], 3.0);
        assert_relative_eq!(out[1], 2.0 * (-0.5f64).exp() + 1.0);
    }

    #[test]
    fn test_negative_rate_is_domain_error() {
        let model = ExponentialDecayModel::new("");
        let ds = DataSet::new(array![0.0], array![0.0]).unwrap();
        let mut out = [0.0];
        let err = model.evaluate(&[1.0, -0.1, 0.0], &ds, &mut out).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_guess() {
        let model = ExponentialDecayModel::new("d_");
        let names: Vec<String> = model.parameters().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["d_amplitude", "d_rate", "d_baseline"]);
        let ds = DataSet::new(array![0.0, 1.0, 3.0], array![5.0, 3.0, 1.0]).unwrap();
        assert_eq!(model.initial_guess(&ds), vec![4.0, 1.0, 1.0]);
    }
}
