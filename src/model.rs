//! Model functions fitted to datasets.
//!
//! A model function computes, for one dataset, the values predicted from
//! the natural-scale parameters of that dataset. It does not subtract the
//! data nor apply weights: the fit context does both.

use crate::data::Dataset;
use crate::error::{FitError, Result};
use crate::parameters::ParameterDefinition;

/// The model function contract.
///
/// `evaluate` is called concurrently from several worker threads with the
/// same dataset and different parameter vectors. Any scratch state must
/// therefore live on the stack (or be thread-local), never in `self`.
pub trait ModelFunction: Send + Sync {
    /// Descriptors of the parameters, in the order `evaluate` expects them.
    fn parameters(&self) -> Vec<ParameterDefinition>;

    /// Computes the predicted values for `dataset` into `target`.
    ///
    /// # Arguments
    ///
    /// * `params` - The natural-scale parameters of this dataset
    /// * `dataset` - The dataset, read-only
    /// * `target` - Output slice, one value per point of the dataset
    ///
    /// # Errors
    ///
    /// Returns [`FitError::Domain`] when the parameters do not make sense
    /// (for instance a negative rate constant). This is a recoverable event.
    fn evaluate(&self, params: &[f64], dataset: &dyn Dataset, target: &mut [f64]) -> Result<()>;

    /// Initial guess for one dataset. Defaults to all ones.
    fn initial_guess(&self, _dataset: &dyn Dataset) -> Vec<f64> {
        vec![1.0; self.parameters().len()]
    }

    /// Number of parameters per dataset.
    fn parameter_count(&self) -> usize {
        self.parameters().len()
    }
}

type EvalFn = dyn Fn(&[f64], f64) -> Result<f64> + Send + Sync;

/// A model defined by a point-wise closure `f(params, x)`.
pub struct FunctionModel {
    definitions: Vec<ParameterDefinition>,
    function: Box<EvalFn>,
    guess: Option<Vec<f64>>,
}

impl FunctionModel {
    /// Create a model from parameter definitions and a point-wise function.
    pub fn new<F>(definitions: Vec<ParameterDefinition>, function: F) -> Self
    where
        F: Fn(&[f64], f64) -> Result<f64> + Send + Sync + 'static,
    {
        Self {
            definitions,
            function: Box::new(function),
            guess: None,
        }
    }

    /// Use these values as the initial guess for every dataset.
    pub fn with_guess(mut self, guess: Vec<f64>) -> Self {
        self.guess = Some(guess);
        self
    }
}

impl ModelFunction for FunctionModel {
    fn parameters(&self) -> Vec<ParameterDefinition> {
        self.definitions.clone()
    }

    fn evaluate(&self, params: &[f64], dataset: &dyn Dataset, target: &mut [f64]) -> Result<()> {
        if params.len() != self.definitions.len() {
            return Err(FitError::Structural(format!(
                "model expects {} parameters, got {}",
                self.definitions.len(),
                params.len()
            )));
        }
        for (t, &x) in target.iter_mut().zip(dataset.x().iter()) {
            *t = (self.function)(params, x)?;
        }
        Ok(())
    }

    fn initial_guess(&self, _dataset: &dyn Dataset) -> Vec<f64> {
        match &self.guess {
            Some(g) => g.clone(),
            None => vec![1.0; self.definitions.len()],
        }
    }
}
