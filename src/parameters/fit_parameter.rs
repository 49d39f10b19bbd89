//! Parameters as seen by a fit.
//!
//! A [`FitParameter`] links one natural-scale value (for one dataset, or
//! for all of them when global) to the optimizer-visible vector. Only free
//! parameters own a slot in that vector; fixed and formula parameters are
//! written into natural space on each unpack.

use super::bijection::Bijection;
use super::expression::{CompiledFormula, FormulaCompiler};
use crate::error::{FitError, Result};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default relative step for numerical derivatives.
pub const DEFAULT_DERIVATION_FACTOR: f64 = 1e-6;

/// Floor on the absolute derivation step.
pub const DEFAULT_MIN_DERIVATION_STEP: f64 = 1e-8;

/// Settings of a free parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct FreeParameter {
    /// Optional transform between optimizer and natural space.
    pub bijection: Option<Bijection>,
    /// Relative step used for numerical derivatives.
    pub derivation_factor: f64,
    /// Smallest absolute derivation step.
    pub min_derivation_step: f64,
}

impl Default for FreeParameter {
    fn default() -> Self {
        Self {
            bijection: None,
            derivation_factor: DEFAULT_DERIVATION_FACTOR,
            min_derivation_step: DEFAULT_MIN_DERIVATION_STEP,
        }
    }
}

/// A parameter computed from a formula over the other parameters of the
/// same dataset. The formula is compiled lazily by
/// [`FitParameter::initialize`].
#[derive(Debug, Clone)]
pub struct FormulaParameter {
    expression: String,
    compiled: Option<Arc<dyn CompiledFormula>>,
}

impl FormulaParameter {
    pub fn new(expression: &str) -> Self {
        Self {
            expression: expression.trim().to_string(),
            compiled: None,
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the expression still needs compiling.
    pub fn is_dirty(&self) -> bool {
        self.compiled.is_none()
    }
}

/// Value of a fixed parameter.
///
/// It is read from natural space each time parameters are packed, which
/// happens through shared references, so the value lives in an atomic
/// cell. Cloning takes a snapshot.
#[derive(Debug, Default)]
pub struct FixedValue(AtomicU64);

impl FixedValue {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Clone for FixedValue {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

/// The three kinds of fit parameters.
#[derive(Debug, Clone)]
pub enum ParameterKind {
    /// Varied by the optimizer.
    Free(FreeParameter),
    /// Constant during the fit. The value is refreshed from natural space
    /// whenever parameters are packed.
    Fixed { value: FixedValue },
    /// Computed from other parameters on every unpack.
    Formula(FormulaParameter),
}

/// One parameter of a fit.
#[derive(Debug, Clone)]
pub struct FitParameter {
    /// Index of the parameter definition.
    pub index: usize,
    /// Dataset the parameter applies to, `None` when global.
    pub dataset: Option<usize>,
    /// Slot in the optimizer vector, for free parameters once the fit
    /// context is initialized.
    pub fit_index: Option<usize>,
    pub kind: ParameterKind,
}

impl FitParameter {
    /// A free parameter with default derivation settings.
    pub fn free(index: usize, dataset: Option<usize>) -> Self {
        Self {
            index,
            dataset,
            fit_index: None,
            kind: ParameterKind::Free(FreeParameter::default()),
        }
    }

    /// A fixed parameter.
    pub fn fixed(index: usize, dataset: Option<usize>, value: f64) -> Self {
        Self {
            index,
            dataset,
            fit_index: None,
            kind: ParameterKind::Fixed {
                value: FixedValue::new(value),
            },
        }
    }

    /// A formula parameter.
    pub fn formula(index: usize, dataset: Option<usize>, expression: &str) -> Self {
        Self {
            index,
            dataset,
            fit_index: None,
            kind: ParameterKind::Formula(FormulaParameter::new(expression)),
        }
    }

    /// Whether the optimizer cannot change the value.
    pub fn is_fixed(&self) -> bool {
        !matches!(self.kind, ParameterKind::Free(_))
    }

    pub fn is_free(&self) -> bool {
        !self.is_fixed()
    }

    pub fn is_formula(&self) -> bool {
        matches!(self.kind, ParameterKind::Formula(_))
    }

    pub fn is_global(&self) -> bool {
        self.dataset.is_none()
    }

    /// Datasets whose natural slot this parameter writes.
    pub fn target_datasets(&self, nb_datasets: usize) -> Range<usize> {
        match self.dataset {
            Some(ds) => ds..ds + 1,
            None => 0..nb_datasets,
        }
    }

    pub fn bijection(&self) -> Option<Bijection> {
        match &self.kind {
            ParameterKind::Free(free) => free.bijection,
            _ => None,
        }
    }

    /// Compiles the formula if needed. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`FitError::Expression`] when the formula references an
    /// undefined name.
    pub fn initialize(&mut self, names: &[String], compiler: &dyn FormulaCompiler) -> Result<()> {
        if let ParameterKind::Formula(formula) = &mut self.kind {
            if formula.compiled.is_none() {
                formula.compiled = Some(compiler.compile(&formula.expression, names)?);
            }
        }
        Ok(())
    }

    /// Parameter indices the value depends on (formula parameters only).
    pub fn dependencies(&self) -> &[usize] {
        match &self.kind {
            ParameterKind::Formula(FormulaParameter {
                compiled: Some(c), ..
            }) => c.dependencies(),
            _ => &[],
        }
    }

    /// Writes the natural value(s) controlled by this parameter.
    ///
    /// Formula parameters read the other values of the dataset from
    /// `unpacked`, so they must run after the parameters they depend on.
    pub fn copy_to_unpacked(
        &self,
        unpacked: &mut [f64],
        fit: &[f64],
        nb_datasets: usize,
        nb_per_dataset: usize,
    ) -> Result<()> {
        match &self.kind {
            ParameterKind::Free(free) => {
                let fi = self.slot()?;
                let mut value = fit[fi];
                if let Some(b) = free.bijection {
                    value = b.forward(value);
                }
                for ds in self.target_datasets(nb_datasets) {
                    unpacked[ds * nb_per_dataset + self.index] = value;
                }
            }
            ParameterKind::Fixed { value } => {
                let value = value.get();
                for ds in self.target_datasets(nb_datasets) {
                    unpacked[ds * nb_per_dataset + self.index] = value;
                }
            }
            ParameterKind::Formula(formula) => {
                let compiled = formula.compiled.as_ref().ok_or_else(|| {
                    FitError::InvalidState(format!(
                        "formula '{}' used before initialization",
                        formula.expression
                    ))
                })?;
                for ds in self.target_datasets(nb_datasets) {
                    let base = ds * nb_per_dataset;
                    let value = compiled.evaluate(&unpacked[base..base + nb_per_dataset])?;
                    unpacked[base + self.index] = value;
                }
            }
        }
        Ok(())
    }

    /// Writes the optimizer value of a free parameter from natural space.
    /// Global parameters read the slot of the first dataset. Other kinds
    /// have nothing to write.
    pub fn copy_to_packed(
        &self,
        fit: &mut [f64],
        unpacked: &[f64],
        nb_per_dataset: usize,
    ) -> Result<()> {
        if let ParameterKind::Free(free) = &self.kind {
            let fi = self.slot()?;
            let value = unpacked[self.dataset.unwrap_or(0) * nb_per_dataset + self.index];
            fit[fi] = match free.bijection {
                Some(b) => b.backward(value),
                None => value,
            };
        }
        Ok(())
    }

    /// Refreshes the cached value of a fixed parameter from natural space.
    pub fn refresh_from_unpacked(&self, unpacked: &[f64], nb_per_dataset: usize) {
        if let ParameterKind::Fixed { value } = &self.kind {
            value.set(unpacked[self.dataset.unwrap_or(0) * nb_per_dataset + self.index]);
        }
    }

    /// Finite difference step for a parameter whose optimizer value is
    /// `value`. Never smaller than the minimum step, even at zero.
    pub fn derivation_step(&self, value: f64) -> f64 {
        let (factor, min_step) = match &self.kind {
            ParameterKind::Free(free) => (free.derivation_factor, free.min_derivation_step),
            _ => (DEFAULT_DERIVATION_FACTOR, DEFAULT_MIN_DERIVATION_STEP),
        };
        let step = factor * value;
        if !step.is_finite() || step.abs() < min_step {
            min_step
        } else {
            step
        }
    }

    /// Text form of the parameter: `value\t!\tfixed[\t!\tbijection]`.
    /// Formula parameters save `=expression` in place of the value.
    pub fn save_text(&self, value: f64) -> String {
        match &self.kind {
            ParameterKind::Formula(f) => format!("={}\t!\t1", f.expression),
            ParameterKind::Fixed { .. } => format!("{}\t!\t1", value),
            ParameterKind::Free(free) => match free.bijection {
                Some(b) => format!("{}\t!\t0\t!\t{}", value, b),
                None => format!("{}\t!\t0", value),
            },
        }
    }

    /// Parses a string written by [`save_text`](Self::save_text). Trailing
    /// fields may be missing, in which case the parameter is free and has
    /// no bijection.
    ///
    /// Returns the parameter and the natural value (NaN for formulas).
    pub fn load_text(index: usize, dataset: Option<usize>, text: &str) -> Result<(Self, f64)> {
        let mut fields = text.split("\t!\t");
        let head = fields.next().unwrap_or("").trim();
        let fixed = match fields.next().map(str::trim) {
            None | Some("0") => false,
            Some("1") => true,
            Some(other) => {
                return Err(FitError::Structural(format!(
                    "invalid fixed flag '{}' in parameter text",
                    other
                )))
            }
        };
        let bijection = fields.next().map(|b| b.parse::<Bijection>()).transpose()?;

        if let Some(expr) = head.strip_prefix('=') {
            return Ok((Self::formula(index, dataset, expr), f64::NAN));
        }
        let value: f64 = head.parse().map_err(|_| {
            FitError::Structural(format!("invalid parameter value '{}'", head))
        })?;
        let param = if fixed {
            Self::fixed(index, dataset, value)
        } else {
            let mut p = Self::free(index, dataset);
            if let ParameterKind::Free(free) = &mut p.kind {
                free.bijection = bijection;
            }
            p
        };
        Ok((param, value))
    }

    fn slot(&self) -> Result<usize> {
        self.fit_index.ok_or_else(|| {
            FitError::InvalidState(format!(
                "free parameter {} has no optimizer slot",
                self.index
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::expression::ExpressionCompiler;
    use approx::assert_relative_eq;

    #[test]
    fn test_global_free_broadcasts() {
        let mut p = FitParameter::free(1, None);
        p.fit_index = Some(0);
        let mut unpacked = vec![0.0; 6];
        p.copy_to_unpacked(&mut unpacked, &[4.0], 3, 2).unwrap();
        assert_eq!(unpacked, vec![0.0, 4.0, 0.0, 4.0, 0.0, 4.0]);
    }

    #[test]
    fn test_bijection_round_trip() {
        let mut p = FitParameter::free(0, Some(1));
        p.fit_index = Some(0);
        if let ParameterKind::Free(free) = &mut p.kind {
            free.bijection = Some(Bijection::Log);
        }
        let unpacked = vec![0.0, 0.0, 3.5, 0.0];
        let mut fit = [0.0];
        p.copy_to_packed(&mut fit, &unpacked, 2).unwrap();
        assert_relative_eq!(fit[0], 3.5f64.ln());

        let mut back = vec![0.0; 4];
        p.copy_to_unpacked(&mut back, &fit, 2, 2).unwrap();
        assert_relative_eq!(back[2], 3.5, max_relative = 1e-12);
    }

    #[test]
    fn test_formula_requires_initialize() {
        let mut p = FitParameter::formula(2, None, "a + b");
        let mut unpacked = vec![1.0, 2.0, 0.0];
        assert!(p.copy_to_unpacked(&mut unpacked, &[], 1, 3).is_err());

        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        p.initialize(&names, &ExpressionCompiler).unwrap();
        p.initialize(&names, &ExpressionCompiler).unwrap();
        assert_eq!(p.dependencies(), &[0, 1]);
        p.copy_to_unpacked(&mut unpacked, &[], 1, 3).unwrap();
        assert_eq!(unpacked[2], 3.0);
    }

    #[test]
    fn test_fixed_refresh() {
        let p = FitParameter::fixed(0, None, 1.0);
        let snapshot = p.clone();
        p.refresh_from_unpacked(&[7.0, 8.0], 2);
        let mut out = vec![0.0; 4];
        p.copy_to_unpacked(&mut out, &[], 2, 2).unwrap();
        assert_eq!(out, vec![7.0, 0.0, 7.0, 0.0]);
        snapshot.copy_to_unpacked(&mut out, &[], 2, 2).unwrap();
        assert_eq!(out, vec![1.0, 0.0, 1.0, 0.0]);
        assert!(p.is_fixed());
        assert!(p.is_global());
    }

    #[test]
    fn test_derivation_step_floor() {
        let p = FitParameter::free(0, None);
        assert_eq!(p.derivation_step(0.0), DEFAULT_MIN_DERIVATION_STEP);
        assert_relative_eq!(p.derivation_step(1e3), 1e-3);
        assert!(p.derivation_step(-1e3) < 0.0);
    }

    #[test]
    fn test_text_round_trip() {
        let mut p = FitParameter::free(0, Some(0));
        if let ParameterKind::Free(free) = &mut p.kind {
            free.bijection = Some(Bijection::Log);
        }
        let text = p.save_text(2.5);
        assert_eq!(text, "2.5\t!\t0\t!\tlog");
        let (q, v) = FitParameter::load_text(0, Some(0), &text).unwrap();
        assert_eq!(v, 2.5);
        assert_eq!(q.bijection(), Some(Bijection::Log));

        let (q, v) = FitParameter::load_text(0, None, "3").unwrap();
        assert!(q.is_free());
        assert_eq!(v, 3.0);

        let (q, _) = FitParameter::load_text(0, None, "1\t!\t1").unwrap();
        assert!(q.is_fixed() && !q.is_formula());

        let f = FitParameter::formula(1, None, "a*2");
        let (q, _) = FitParameter::load_text(1, None, &f.save_text(0.0)).unwrap();
        assert!(q.is_formula());

        assert!(FitParameter::load_text(0, None, "abc").is_err());
        assert!(FitParameter::load_text(0, None, "1\t!\t7").is_err());
    }
}
