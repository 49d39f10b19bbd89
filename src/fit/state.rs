//! Frozen evaluation state of a fit.
//!
//! [`FitCore`] holds everything needed to turn an optimizer vector into
//! weighted residuals. It is shared read-only (behind an `Arc`) between
//! the orchestrating thread and the Jacobian workers, so evaluating it
//! never mutates anything but the evaluation counter.

use crate::data::Dataset;
use crate::error::{FitError, Result};
use crate::model::ModelFunction;
use crate::parameters::{FitParameter, ParameterDefinition};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct FitCore {
    pub(crate) model: Arc<dyn ModelFunction>,
    pub(crate) datasets: Vec<Arc<dyn Dataset>>,
    pub(crate) definitions: Vec<ParameterDefinition>,
    pub(crate) names: Vec<String>,
    pub(crate) parameters: Vec<FitParameter>,
    /// Positions in `parameters` of free and fixed parameters.
    pub(crate) plain: Vec<usize>,
    /// Positions in `parameters` of formula parameters, in evaluation order.
    pub(crate) formula_order: Vec<usize>,
    /// Position in `parameters` of the free parameter owning each slot.
    pub(crate) free_positions: Vec<usize>,
    /// Square root of point weight times buffer weight, for every point.
    pub(crate) weights: Vec<f64>,
    /// First row of each dataset, followed by the number of points.
    pub(crate) offsets: Vec<usize>,
    pub(crate) evaluations: Arc<AtomicUsize>,
}

impl FitCore {
    pub(crate) fn new(
        model: Arc<dyn ModelFunction>,
        datasets: Vec<Arc<dyn Dataset>>,
        parameters: Vec<FitParameter>,
    ) -> Self {
        let definitions = model.parameters();
        let names = definitions.iter().map(|d| d.name.clone()).collect();
        let mut offsets = Vec::with_capacity(datasets.len() + 1);
        let mut total = 0;
        for ds in &datasets {
            offsets.push(total);
            total += ds.len();
        }
        offsets.push(total);
        Self {
            model,
            datasets,
            definitions,
            names,
            parameters,
            plain: Vec::new(),
            formula_order: Vec::new(),
            free_positions: Vec::new(),
            weights: vec![1.0; total],
            offsets,
            evaluations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn dataset_count(&self) -> usize {
        self.datasets.len()
    }

    pub fn parameters_per_dataset(&self) -> usize {
        self.definitions.len()
    }

    pub fn data_points(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn free_parameters(&self) -> usize {
        self.free_positions.len()
    }

    pub fn natural_len(&self) -> usize {
        self.dataset_count() * self.parameters_per_dataset()
    }

    pub fn dataset_rows(&self, ds: usize) -> Range<usize> {
        self.offsets[ds]..self.offsets[ds + 1]
    }

    /// Dataset affected by the free parameter in slot `fit_index`.
    pub fn column_dataset(&self, fit_index: usize) -> Option<usize> {
        if self.dataset_count() == 1 {
            return None;
        }
        self.parameters[self.free_positions[fit_index]].dataset
    }

    /// Writes the natural parameters for `x` into `natural`.
    pub fn unpack_into(&self, x: &[f64], natural: &mut [f64]) -> Result<()> {
        if x.len() != self.free_parameters() {
            return Err(FitError::Structural(format!(
                "expected {} optimizer parameters, got {}",
                self.free_parameters(),
                x.len()
            )));
        }
        if natural.len() != self.natural_len() {
            return Err(FitError::Structural(format!(
                "expected {} natural parameters, got {}",
                self.natural_len(),
                natural.len()
            )));
        }
        let nb_ds = self.dataset_count();
        let n = self.parameters_per_dataset();
        for &i in self.plain.iter().chain(self.formula_order.iter()) {
            self.parameters[i].copy_to_unpacked(natural, x, nb_ds, n)?;
        }
        Ok(())
    }

    pub fn unpack(&self, x: &[f64]) -> Result<Vec<f64>> {
        let mut natural = vec![0.0; self.natural_len()];
        self.unpack_into(x, &mut natural)?;
        Ok(natural)
    }

    /// Reads the values of fixed parameters from `natural`.
    pub fn refresh_fixed(&self, natural: &[f64]) -> Result<()> {
        if natural.len() != self.natural_len() {
            return Err(FitError::Structural(format!(
                "expected {} natural parameters, got {}",
                self.natural_len(),
                natural.len()
            )));
        }
        let n = self.parameters_per_dataset();
        for p in self.parameters.iter().filter(|p| p.is_fixed()) {
            p.refresh_from_unpacked(natural, n);
        }
        Ok(())
    }

    /// Optimizer vector for `natural`. Fixed parameters take their values
    /// from `natural` too, for every later unpack.
    pub fn pack(&self, natural: &[f64]) -> Result<Vec<f64>> {
        self.refresh_fixed(natural)?;
        let mut x = vec![0.0; self.free_parameters()];
        for &i in &self.free_positions {
            self.parameters[i].copy_to_packed(&mut x, natural, self.parameters_per_dataset())?;
        }
        Ok(x)
    }

    /// Weighted model predictions of one dataset, data not subtracted.
    pub fn dataset_model(&self, natural: &[f64], ds: usize, out: &mut [f64]) -> Result<()> {
        let n = self.parameters_per_dataset();
        self.model
            .evaluate(&natural[ds * n..(ds + 1) * n], self.datasets[ds].as_ref(), out)?;
        let weights = &self.weights[self.dataset_rows(ds)];
        for (v, w) in out.iter_mut().zip(weights) {
            *v *= w;
        }
        check_finite(out, ds)
    }

    /// Weighted residuals of one dataset.
    pub fn dataset_residuals(&self, natural: &[f64], ds: usize, out: &mut [f64]) -> Result<()> {
        let n = self.parameters_per_dataset();
        self.model
            .evaluate(&natural[ds * n..(ds + 1) * n], self.datasets[ds].as_ref(), out)?;
        let y = self.datasets[ds].y();
        let weights = &self.weights[self.dataset_rows(ds)];
        for ((v, yi), w) in out.iter_mut().zip(y.iter()).zip(weights) {
            *v = (*v - yi) * w;
        }
        check_finite(out, ds)
    }

    /// Weighted residuals of every dataset, concatenated.
    pub fn residuals_into(&self, x: &[f64], out: &mut [f64]) -> Result<()> {
        let natural = self.unpack(x)?;
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        for ds in 0..self.dataset_count() {
            let rows = self.dataset_rows(ds);
            self.dataset_residuals(&natural, ds, &mut out[rows])?;
        }
        Ok(())
    }

    /// Weighted observations.
    pub fn weighted_data(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.data_points());
        for ds in 0..self.dataset_count() {
            let weights = &self.weights[self.dataset_rows(ds)];
            out.extend(
                self.datasets[ds]
                    .y()
                    .iter()
                    .zip(weights)
                    .map(|(y, w)| y * w),
            );
        }
        out
    }

    /// Forward-difference derivative of the residuals along slot `column`.
    ///
    /// `base` holds the residuals at `x`. The step is the parameter's
    /// derivation step multiplied by `step_scale`. Only the rows of the
    /// datasets the parameter affects are evaluated; the others are zero.
    pub fn derivative_column(
        &self,
        x: &[f64],
        base: &[f64],
        column: usize,
        step_scale: f64,
    ) -> Result<Vec<f64>> {
        let param = &self.parameters[self.free_positions[column]];
        let step = param.derivation_step(x[column]) * step_scale;
        let mut perturbed = x.to_vec();
        perturbed[column] += step;
        // actual step after rounding
        let step = perturbed[column] - x[column];
        if step == 0.0 || !step.is_finite() {
            return Err(FitError::Domain(format!(
                "derivation step of {} vanishes at {}",
                self.describe_column(column),
                x[column]
            )));
        }

        let natural = self.unpack(&perturbed)?;
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        let mut out = vec![0.0; self.data_points()];
        let datasets = match self.column_dataset(column) {
            Some(ds) => ds..ds + 1,
            None => 0..self.dataset_count(),
        };
        for ds in datasets {
            let rows = self.dataset_rows(ds);
            self.dataset_residuals(&natural, ds, &mut out[rows.clone()])?;
            for r in rows {
                out[r] = (out[r] - base[r]) / step;
            }
        }
        Ok(out)
    }

    /// [`derivative_column`](Self::derivative_column) with fallbacks when
    /// the perturbed point is outside the model's domain: a backward step,
    /// then smaller steps on either side.
    pub fn derivative_column_with_retries(
        &self,
        x: &[f64],
        base: &[f64],
        column: usize,
    ) -> Result<Vec<f64>> {
        let mut last = None;
        for &scale in &DERIVATION_FALLBACKS {
            match self.derivative_column(x, base, column, scale) {
                Ok(c) => return Ok(c),
                Err(e) if e.is_recoverable() => {
                    log::trace!("derivative of column {} failed with scale {}: {}", column, scale, e);
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(match last {
            Some(e) => FitError::Domain(format!(
                "no valid step to compute the derivative of parameter {}: {}",
                self.describe_column(column),
                e
            )),
            None => FitError::Domain(format!("derivative of column {} unavailable", column)),
        })
    }

    /// Name of the free parameter of a column, with its dataset.
    pub fn describe_column(&self, column: usize) -> String {
        let p = &self.parameters[self.free_positions[column]];
        match p.dataset {
            Some(ds) => format!("{}[#{}]", self.names[p.index], ds),
            None => self.names[p.index].clone(),
        }
    }
}

/// Step multipliers tried in turn for one Jacobian column.
pub const DERIVATION_FALLBACKS: [f64; 5] = [1.0, -1.0, 0.5, -0.5, 0.125];

fn check_finite(values: &[f64], ds: usize) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(FitError::Domain(format!(
            "non-finite values in the evaluation of dataset #{}",
            ds
        )))
    }
}
