//! The fit context: datasets, model, parameters and evaluation.

use super::state::FitCore;
use crate::config::FitConfig;
use crate::data::Dataset;
use crate::error::{FitError, Result};
use crate::jacobian::{evaluate_sequential, resolve_thread_count, JacobianEvaluator, SparseJacobian};
use crate::model::ModelFunction;
use crate::parameters::{
    formula_order, Bijection, ExpressionCompiler, FitParameter, FixedValue, FormulaCompiler,
    ParameterDefinition, ParameterKind,
};
use ndarray::Array1;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Owns everything a fit needs: datasets, model function, parameters,
/// weights and the Jacobian worker pool.
///
/// The context is edited (fixing, globalizing, formulas...) and then
/// [`initialize`](Self::initialize)d, after which it is only read. Engines
/// share it through an `Arc`.
pub struct FitContext {
    core: Arc<FitCore>,
    compiler: Arc<dyn FormulaCompiler>,
    threads: i32,
    use_errors: bool,
    split_independent: bool,
    svd_threshold: f64,
    evaluator: Option<JacobianEvaluator>,
    subordinates: Vec<Arc<FitContext>>,
    initialized: bool,
}

impl std::fmt::Debug for FitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FitContext")
            .field("datasets", &self.core.dataset_count())
            .field("parameters", &self.core.names)
            .field("free", &self.core.free_parameters())
            .field("initialized", &self.initialized)
            .finish()
    }
}

fn parameter_order(p: &FitParameter) -> (usize, usize) {
    (p.dataset.map_or(0, |d| d + 1), p.index)
}

impl FitContext {
    /// Create a context with the default parameters of the model: one
    /// global instance for parameters that cannot be dataset-specific, one
    /// per dataset otherwise, fixed when the definition says so.
    ///
    /// # Errors
    ///
    /// Returns a structural error when there is no dataset or the model
    /// has no parameters.
    pub fn new(model: Arc<dyn ModelFunction>, datasets: Vec<Arc<dyn Dataset>>) -> Result<Self> {
        if datasets.is_empty() {
            return Err(FitError::Structural("a fit needs at least one dataset".into()));
        }
        let definitions = model.parameters();
        if definitions.is_empty() {
            return Err(FitError::Structural("the model has no parameters".into()));
        }

        let mut parameters = Vec::new();
        for (index, def) in definitions.iter().enumerate() {
            let make = |ds: Option<usize>| {
                if def.fixed_by_default {
                    FitParameter::fixed(index, ds, f64::NAN)
                } else {
                    FitParameter::free(index, ds)
                }
            };
            if def.can_be_buffer_specific && datasets.len() > 1 {
                parameters.extend((0..datasets.len()).map(|ds| make(Some(ds))));
            } else if def.can_be_buffer_specific {
                parameters.push(make(Some(0)));
            } else {
                parameters.push(make(None));
            }
        }
        parameters.sort_by_key(parameter_order);

        Ok(Self::from_parts(FitCore::new(model, datasets, parameters)))
    }

    fn from_parts(core: FitCore) -> Self {
        Self {
            core: Arc::new(core),
            compiler: Arc::new(ExpressionCompiler),
            threads: 0,
            use_errors: true,
            split_independent: true,
            svd_threshold: crate::uncertainty::DEFAULT_SVD_THRESHOLD,
            evaluator: None,
            subordinates: Vec::new(),
            initialized: false,
        }
    }

    /// Applies the context-related settings of a configuration.
    pub fn apply_config(&mut self, config: &FitConfig) {
        self.threads = config.threads;
        self.use_errors = config.use_errors;
        self.split_independent = config.split_independent;
        self.svd_threshold = config.svd_threshold;
        self.initialized = false;
    }

    /// Relative singular value threshold used for covariance matrices.
    pub fn set_svd_threshold(&mut self, threshold: f64) {
        self.svd_threshold = threshold;
    }

    pub fn svd_threshold(&self) -> f64 {
        self.svd_threshold
    }

    /// Number of Jacobian threads: positive for a fixed count, zero or
    /// negative for all cores but that many.
    pub fn set_threads(&mut self, threads: i32) {
        self.threads = threads;
        self.initialized = false;
    }

    /// Whether per-point standard errors weight the residuals.
    pub fn set_use_errors(&mut self, use_errors: bool) {
        self.use_errors = use_errors;
        self.initialized = false;
    }

    /// Whether independent datasets get subordinate contexts.
    pub fn set_split_independent(&mut self, split: bool) {
        self.split_independent = split;
        self.initialized = false;
    }

    /// Replaces the formula compiler.
    pub fn set_formula_compiler(&mut self, compiler: Arc<dyn FormulaCompiler>) {
        self.compiler = compiler;
        self.initialized = false;
    }

    // Editing

    fn index_of(&self, name: &str) -> Result<usize> {
        self.core
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| FitError::Structural(format!("unknown parameter '{}'", name)))
    }

    /// Positions of the instances of `index` covering `dataset`, or of all
    /// instances when `dataset` is `None`.
    fn targets(&self, index: usize, dataset: Option<usize>) -> Result<Vec<usize>> {
        if let Some(ds) = dataset {
            if ds >= self.core.dataset_count() {
                return Err(FitError::Structural(format!("no dataset #{}", ds)));
            }
        }
        let found: Vec<usize> = self
            .core
            .parameters
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.index == index
                    && match (dataset, p.dataset) {
                        (None, _) | (_, None) => true,
                        (Some(a), Some(b)) => a == b,
                    }
            })
            .map(|(i, _)| i)
            .collect();
        if found.is_empty() {
            return Err(FitError::Structural(format!(
                "no parameter {} for dataset {:?}",
                index, dataset
            )));
        }
        Ok(found)
    }

    fn edit(&mut self) -> &mut FitCore {
        self.initialized = false;
        self.subordinates.clear();
        Arc::make_mut(&mut self.core)
    }

    fn set_kind(&mut self, name: &str, dataset: Option<usize>, kind: ParameterKind) -> Result<()> {
        let index = self.index_of(name)?;
        let targets = self.targets(index, dataset)?;
        let core = self.edit();
        for t in targets {
            core.parameters[t].kind = kind.clone();
            core.parameters[t].fit_index = None;
        }
        Ok(())
    }

    /// Fixes or frees a parameter, for one dataset or all of them. The
    /// value of a fixed parameter is taken from the natural parameters
    /// packed last, which is the initial guess of each fit.
    pub fn set_fixed(&mut self, name: &str, dataset: Option<usize>, fixed: bool) -> Result<()> {
        let kind = if fixed {
            ParameterKind::Fixed {
                value: FixedValue::new(f64::NAN),
            }
        } else {
            ParameterKind::Free(Default::default())
        };
        self.set_kind(name, dataset, kind)
    }

    /// Turns a parameter into a formula over the other parameters of the
    /// same dataset.
    pub fn set_formula(&mut self, name: &str, dataset: Option<usize>, formula: &str) -> Result<()> {
        self.set_kind(
            name,
            dataset,
            ParameterKind::Formula(crate::parameters::FormulaParameter::new(formula)),
        )
    }

    /// Sets the bijection of a free parameter.
    pub fn set_bijection(
        &mut self,
        name: &str,
        dataset: Option<usize>,
        bijection: Option<Bijection>,
    ) -> Result<()> {
        self.edit_free(name, dataset, |free| free.bijection = bijection)
    }

    /// Sets the relative derivation step of a free parameter.
    pub fn set_derivation_factor(
        &mut self,
        name: &str,
        dataset: Option<usize>,
        factor: f64,
    ) -> Result<()> {
        if !(factor.is_finite() && factor > 0.0) {
            return Err(FitError::Structural(format!(
                "invalid derivation factor {}",
                factor
            )));
        }
        self.edit_free(name, dataset, |free| free.derivation_factor = factor)
    }

    fn edit_free(
        &mut self,
        name: &str,
        dataset: Option<usize>,
        f: impl Fn(&mut crate::parameters::FreeParameter),
    ) -> Result<()> {
        let index = self.index_of(name)?;
        let targets = self.targets(index, dataset)?;
        if targets.iter().any(|&t| self.core.parameters[t].is_fixed()) {
            return Err(FitError::Structural(format!(
                "parameter '{}' is not free",
                name
            )));
        }
        let core = self.edit();
        for t in targets {
            if let ParameterKind::Free(free) = &mut core.parameters[t].kind {
                f(free);
            }
        }
        Ok(())
    }

    /// Makes a parameter global (one instance shared by all datasets) or
    /// dataset-specific. Going global keeps the kind of the first
    /// instance; going local duplicates the global one.
    pub fn set_global(&mut self, name: &str, global: bool) -> Result<()> {
        let index = self.index_of(name)?;
        let nb_ds = self.core.dataset_count();
        let positions = self.targets(index, None)?;
        let first = self.core.parameters[positions[0]].clone();
        if global == first.is_global() && positions.len() == 1 && (global || nb_ds == 1) {
            return Ok(());
        }
        if !global && !self.core.definitions[index].can_be_buffer_specific {
            return Err(FitError::Structural(format!(
                "parameter '{}' cannot be dataset-specific",
                name
            )));
        }

        let core = self.edit();
        core.parameters.retain(|p| p.index != index);
        if global {
            let mut p = first;
            p.dataset = None;
            p.fit_index = None;
            core.parameters.push(p);
        } else {
            for ds in 0..nb_ds {
                let mut p = first.clone();
                p.dataset = Some(ds);
                p.fit_index = None;
                core.parameters.push(p);
            }
        }
        core.parameters.sort_by_key(parameter_order);
        Ok(())
    }

    // Initialization

    /// Prepares the context for evaluation.
    ///
    /// Compiles formulas, orders them, assigns optimizer slots to free
    /// parameters, takes fixed values from `initial_guess` (the natural
    /// parameters, dataset after dataset), computes weights, starts the
    /// Jacobian pool and splits independent datasets.
    ///
    /// # Errors
    ///
    /// Structural errors: wrong guess length, parameters not covering every
    /// dataset exactly once, unknown names or cycles in formulas, more free
    /// parameters than data points.
    pub fn initialize(&mut self, initial_guess: &[f64]) -> Result<()> {
        self.initialized = false;
        let compiler = Arc::clone(&self.compiler);
        let use_errors = self.use_errors;
        {
            let core = Arc::make_mut(&mut self.core);
            prepare_core(core, compiler.as_ref(), initial_guess, use_errors)?;
        }

        let threads = resolve_thread_count(self.threads);
        let wanted = threads > 1 && self.core.free_parameters() > 1;
        match (&self.evaluator, wanted) {
            (Some(e), true) if e.threads() == threads => {}
            (_, true) => self.evaluator = Some(JacobianEvaluator::new(threads)?),
            (_, false) => self.evaluator = None,
        }

        self.subordinates.clear();
        if self.split_independent && self.independent_datasets() {
            self.subordinates = self.build_subordinates(initial_guess)?;
            log::debug!(
                "datasets are independent, split into {} subordinate fits",
                self.subordinates.len()
            );
        }
        self.initialized = true;
        log::info!(
            "fit initialized: {} datasets, {} points, {} free parameters",
            self.core.dataset_count(),
            self.core.data_points(),
            self.core.free_parameters()
        );
        Ok(())
    }

    fn build_subordinates(&self, initial_guess: &[f64]) -> Result<Vec<Arc<FitContext>>> {
        let n = self.core.parameters_per_dataset();
        let mut subs = Vec::with_capacity(self.core.dataset_count());
        for ds in 0..self.core.dataset_count() {
            let parameters: Vec<FitParameter> = self
                .core
                .parameters
                .iter()
                .filter(|p| p.dataset.map_or(true, |d| d == ds))
                .map(|p| {
                    let mut p = p.clone();
                    p.dataset = Some(0);
                    p.fit_index = None;
                    p
                })
                .collect();
            let core = FitCore::new(
                Arc::clone(&self.core.model),
                vec![Arc::clone(&self.core.datasets[ds])],
                parameters,
            );
            let mut sub = FitContext::from_parts(core);
            sub.compiler = Arc::clone(&self.compiler);
            sub.threads = 1;
            sub.use_errors = self.use_errors;
            sub.split_independent = false;
            sub.svd_threshold = self.svd_threshold;
            sub.initialize(&initial_guess[ds * n..(ds + 1) * n])?;
            subs.push(Arc::new(sub));
        }
        Ok(subs)
    }

    fn check_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(FitError::InvalidState(
                "the fit context must be initialized before use".into(),
            ))
        }
    }

    // Queries

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn dataset_count(&self) -> usize {
        self.core.dataset_count()
    }

    pub fn datasets(&self) -> &[Arc<dyn Dataset>] {
        &self.core.datasets
    }

    pub fn parameters_per_dataset(&self) -> usize {
        self.core.parameters_per_dataset()
    }

    pub fn definitions(&self) -> &[ParameterDefinition] {
        &self.core.definitions
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.core.names
    }

    pub fn parameters(&self) -> &[FitParameter] {
        &self.core.parameters
    }

    /// The instance covering `dataset` for the parameter called `name`.
    pub fn parameter(&self, name: &str, dataset: usize) -> Option<&FitParameter> {
        let index = self.index_of(name).ok()?;
        self.core
            .parameters
            .iter()
            .find(|p| p.index == index && p.dataset.map_or(true, |d| d == dataset))
    }

    /// The free parameter owning each optimizer slot.
    pub fn free_parameter_list(&self) -> Vec<&FitParameter> {
        self.core
            .free_positions
            .iter()
            .map(|&i| &self.core.parameters[i])
            .collect()
    }

    pub fn data_points(&self) -> usize {
        self.core.data_points()
    }

    pub fn free_parameters(&self) -> usize {
        self.core.free_parameters()
    }

    /// Number of natural parameters: datasets times parameters per dataset.
    pub fn natural_len(&self) -> usize {
        self.core.natural_len()
    }

    /// Data points minus free parameters. Initialization rejects fits where
    /// this would be negative.
    pub fn degrees_of_freedom(&self) -> usize {
        self.core.data_points().saturating_sub(self.core.free_parameters())
    }

    /// The weight applied to each residual.
    pub fn weights(&self) -> &[f64] {
        &self.core.weights
    }

    /// Number of residual evaluations so far, Jacobian columns included.
    pub fn evaluations(&self) -> usize {
        self.core.evaluations.load(Ordering::Relaxed)
    }

    /// Whether no free parameter couples datasets together.
    pub fn independent_datasets(&self) -> bool {
        self.core.dataset_count() > 1
            && !self
                .core
                .parameters
                .iter()
                .any(|p| p.is_free() && p.is_global())
    }

    /// One context per dataset when datasets are independent.
    pub fn subordinates(&self) -> &[Arc<FitContext>] {
        &self.subordinates
    }

    /// Worker threads used for the Jacobian (1 when sequential).
    pub fn jacobian_threads(&self) -> usize {
        self.evaluator.as_ref().map_or(1, |e| e.threads())
    }

    /// Derivative jobs scheduled on the worker pool so far.
    pub fn jobs_scheduled(&self) -> usize {
        self.evaluator.as_ref().map_or(0, |e| e.jobs_scheduled())
    }

    /// The model's initial guess for every dataset, concatenated.
    pub fn model_initial_guess(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.natural_len());
        for ds in &self.core.datasets {
            out.extend(self.core.model.initial_guess(ds.as_ref()));
        }
        out
    }

    // Evaluation

    /// Optimizer vector for the natural parameters `natural`.
    ///
    /// The values of fixed parameters are read from `natural`, here and in
    /// the subordinate contexts.
    pub fn pack(&self, natural: &[f64]) -> Result<Array1<f64>> {
        self.check_initialized()?;
        let x = self.core.pack(natural)?;
        let n = self.core.parameters_per_dataset();
        for (ds, sub) in self.subordinates.iter().enumerate() {
            sub.core.refresh_fixed(&natural[ds * n..(ds + 1) * n])?;
        }
        Ok(Array1::from(x))
    }

    /// Natural parameters for the optimizer vector `x`, dataset after
    /// dataset. Formula parameters are computed after the others.
    pub fn unpack(&self, x: &Array1<f64>) -> Result<Vec<f64>> {
        self.check_initialized()?;
        self.core.unpack(&x.to_vec())
    }

    /// Weighted residuals (model minus data) for all datasets.
    pub fn f(&self, x: &Array1<f64>) -> Result<Array1<f64>> {
        self.check_initialized()?;
        let mut out = vec![0.0; self.core.data_points()];
        self.core.residuals_into(&x.to_vec(), &mut out)?;
        Ok(Array1::from(out))
    }

    /// Weighted model predictions, data not subtracted.
    pub fn evaluate_model(&self, x: &Array1<f64>) -> Result<Array1<f64>> {
        self.check_initialized()?;
        let natural = self.core.unpack(&x.to_vec())?;
        self.core.evaluations.fetch_add(1, Ordering::Relaxed);
        let mut out = vec![0.0; self.core.data_points()];
        for ds in 0..self.core.dataset_count() {
            let rows = self.core.dataset_rows(ds);
            self.core.dataset_model(&natural, ds, &mut out[rows])?;
        }
        Ok(Array1::from(out))
    }

    /// Weighted observations.
    pub fn weighted_data(&self) -> Array1<f64> {
        Array1::from(self.core.weighted_data())
    }

    /// Sum of the squared weighted residuals at `x`.
    pub fn chi_square(&self, x: &Array1<f64>) -> Result<f64> {
        Ok(self.f(x)?.iter().map(|v| v * v).sum())
    }

    /// Norm of the weighted residual vector at `x`.
    pub fn residual_norm(&self, x: &Array1<f64>) -> Result<f64> {
        Ok(self.chi_square(x)?.sqrt())
    }

    /// Jacobian at `x`.
    pub fn df(&self, x: &Array1<f64>) -> Result<SparseJacobian> {
        let base = self.f(x)?;
        self.df_at(x, &base)
    }

    /// Residuals and Jacobian at `x`.
    pub fn fdf(&self, x: &Array1<f64>) -> Result<(Array1<f64>, SparseJacobian)> {
        let base = self.f(x)?;
        let jacobian = self.df_at(x, &base)?;
        Ok((base, jacobian))
    }

    /// Jacobian at `x` when the residuals `base` at `x` are already known.
    /// Uses the worker pool when there is one.
    pub fn df_at(&self, x: &Array1<f64>, base: &Array1<f64>) -> Result<SparseJacobian> {
        self.check_initialized()?;
        let mut jacobian = self.empty_jacobian();
        let x = x.to_vec();
        let base = base.to_vec();
        match &self.evaluator {
            Some(pool) => pool.evaluate(&self.core, &x, &base, &mut jacobian)?,
            None => evaluate_sequential(&self.core, &x, &base, &mut jacobian)?,
        }
        Ok(jacobian)
    }

    /// Jacobian at `x` computed on the calling thread only.
    pub fn df_sequential(&self, x: &Array1<f64>, base: &Array1<f64>) -> Result<SparseJacobian> {
        self.check_initialized()?;
        let mut jacobian = self.empty_jacobian();
        evaluate_sequential(&self.core, &x.to_vec(), &base.to_vec(), &mut jacobian)?;
        Ok(jacobian)
    }

    fn empty_jacobian(&self) -> SparseJacobian {
        let columns = (0..self.core.free_parameters())
            .map(|j| self.core.column_dataset(j))
            .collect();
        SparseJacobian::new(self.core.offsets.clone(), columns)
    }
}

/// Everything [`FitContext::initialize`] does to the shared state.
fn prepare_core(
    core: &mut FitCore,
    compiler: &dyn FormulaCompiler,
    initial_guess: &[f64],
    use_errors: bool,
) -> Result<()> {
    let nb_ds = core.dataset_count();
    let n = core.parameters_per_dataset();
    if initial_guess.len() != nb_ds * n {
        return Err(FitError::Structural(format!(
            "initial guess has {} values, expected {} ({} datasets x {} parameters)",
            initial_guess.len(),
            nb_ds * n,
            nb_ds,
            n
        )));
    }

    // every (parameter, dataset) pair is covered exactly once
    let mut coverage = vec![0usize; nb_ds * n];
    for p in &core.parameters {
        if p.index >= n {
            return Err(FitError::Structural(format!(
                "parameter index {} out of range",
                p.index
            )));
        }
        if let Some(ds) = p.dataset {
            if ds >= nb_ds {
                return Err(FitError::Structural(format!("no dataset #{}", ds)));
            }
        }
        for ds in p.target_datasets(nb_ds) {
            coverage[ds * n + p.index] += 1;
        }
    }
    if let Some(slot) = coverage.iter().position(|&c| c != 1) {
        return Err(FitError::Structural(format!(
            "parameter '{}' of dataset #{} is defined {} times",
            core.names[slot % n],
            slot / n,
            coverage[slot]
        )));
    }

    let names = core.names.clone();
    core.plain.clear();
    core.free_positions.clear();
    for (i, p) in core.parameters.iter_mut().enumerate() {
        p.initialize(&names, compiler)?;
        p.refresh_from_unpacked(initial_guess, n);
        p.fit_index = None;
        if p.is_free() {
            p.fit_index = Some(core.free_positions.len());
            core.free_positions.push(i);
        }
        if !p.is_formula() {
            core.plain.push(i);
        }
    }
    core.formula_order = formula_order(&core.parameters, &names)?;

    if core.free_parameters() > core.data_points() {
        return Err(FitError::Structural(format!(
            "{} free parameters for only {} data points",
            core.free_parameters(),
            core.data_points()
        )));
    }

    let with_errors = core.datasets.iter().filter(|d| d.errors().is_some()).count();
    let errors_used = use_errors && with_errors == nb_ds;
    if use_errors && with_errors > 0 && with_errors < nb_ds {
        log::warn!(
            "only {} of {} datasets have errors, weighting by errors is disabled for all",
            with_errors,
            nb_ds
        );
    }
    let mut weights = Vec::with_capacity(core.data_points());
    for ds in &core.datasets {
        let buffer = ds.weight();
        match (errors_used, ds.errors()) {
            (true, Some(errors)) => {
                weights.extend(errors.iter().map(|e| (buffer / (e * e)).sqrt()))
            }
            _ => weights.extend(std::iter::repeat(buffer.sqrt()).take(ds.len())),
        }
    }
    core.weights = weights;
    Ok(())
}
