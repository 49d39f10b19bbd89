//! Nelder-Mead simplex engine.
//!
//! The simplex never keeps a vertex the model cannot evaluate: every
//! trial point that raises a domain error is treated as infinitely bad,
//! and the step backs off towards its origin, halving its length, until a
//! valid point is found or the step falls below a threshold.

use super::stored::{sort_by_residuals, StoredParameters};
use super::{EngineBase, EngineOptionSpec, EngineOptions, EngineState, FitEngine, IterationStatus};
use crate::error::{FitError, Result};
use crate::fit::FitContext;
use ndarray::{Array1, Array2};
use std::sync::Arc;

fn linear_combination(f1: f64, v1: &Array1<f64>, f2: f64, v2: &Array1<f64>) -> Array1<f64> {
    v1 * f1 + v2 * f2
}

/// The Nelder-Mead algorithm over a fallible objective.
pub struct Simplex<F>
where
    F: Fn(&Array1<f64>) -> Result<f64>,
{
    function: F,
    /// Vertices, best first.
    pub vertices: Vec<StoredParameters>,
    /// Reflection factor
    pub alpha: f64,
    /// Expansion factor
    pub beta: f64,
    /// Contraction factor
    pub gamma: f64,
    /// Shrink factor
    pub delta: f64,
    /// Relative change of the best vertex below which the search ends
    pub threshold: f64,
    /// Smallest fraction of a step tried when backing off
    pub backoff_threshold: f64,
}

impl<F> Simplex<F>
where
    F: Fn(&Array1<f64>) -> Result<f64>,
{
    pub fn new(function: F) -> Self {
        Self {
            function,
            vertices: Vec::new(),
            alpha: 1.0,
            beta: 2.0,
            gamma: 0.5,
            delta: 0.5,
            threshold: 1e-4,
            backoff_threshold: 1e-3,
        }
    }

    pub fn compute(&self, v: Array1<f64>) -> Result<StoredParameters> {
        let r = (self.function)(&v)?;
        Ok(StoredParameters::new(v, r))
    }

    pub fn sort(&mut self) {
        sort_by_residuals(&mut self.vertices);
    }

    /// Evaluates `dest`, or failing that points closer and closer to
    /// `origin` (which must be valid).
    ///
    /// # Errors
    ///
    /// Non-domain errors are returned at once; a domain error is returned
    /// when even the smallest step is invalid.
    pub fn step_towards(&self, origin: &Array1<f64>, dest: &Array1<f64>) -> Result<StoredParameters> {
        let mut factor = 1.0;
        let mut last = None;
        while factor >= self.backoff_threshold {
            let current = linear_combination(factor, dest, 1.0 - factor, origin);
            match self.compute(current) {
                Ok(s) => return Ok(s),
                Err(e) if e.is_recoverable() => {
                    last = Some(e);
                    factor *= 0.5;
                }
                Err(e) => return Err(e),
            }
        }
        Err(FitError::Domain(format!(
            "could not find a suitable step{}",
            last.map(|e| format!(" ({})", e)).unwrap_or_default()
        )))
    }

    /// A vertex obtained by multiplying coordinate `index` of `center` by
    /// `factor` (or setting it to `factor` when zero), trying the division
    /// when the multiplication leads nowhere.
    pub fn initial_vertex(
        &self,
        center: &Array1<f64>,
        index: usize,
        factor: f64,
    ) -> Result<StoredParameters> {
        let mut t = center.clone();
        if t[index] != 0.0 {
            t[index] *= factor;
        } else {
            t[index] = factor;
        }
        match self.step_towards(center, &t) {
            Ok(s) => Ok(s),
            Err(e) if e.is_recoverable() => {
                if center[index] != 0.0 {
                    t[index] = center[index] / factor;
                } else {
                    t[index] = 1.0 / factor;
                }
                self.step_towards(center, &t)
            }
            Err(e) => Err(e),
        }
    }

    /// Builds the n+1 vertices around a valid `center`.
    pub fn initialize(&mut self, center: &Array1<f64>, factor: f64) -> Result<()> {
        let mut vertices = Vec::with_capacity(center.len() + 1);
        vertices.push(self.compute(center.clone())?);
        for i in 0..center.len() {
            vertices.push(self.initial_vertex(center, i, factor)?);
        }
        self.vertices = vertices;
        self.sort();
        Ok(())
    }

    /// Centroid of all the vertices but the worst.
    pub fn centroid(&self) -> Array1<f64> {
        let n = self.vertices.len() - 1;
        let mut c = Array1::zeros(self.vertices[0].parameters.len());
        for v in &self.vertices[..n] {
            c += &v.parameters;
        }
        c / n as f64
    }

    /// One Nelder-Mead step: reflection, expansion, outer or inner
    /// contraction, shrink.
    pub fn iterate(&mut self) -> Result<IterationStatus> {
        if self.vertices.len() < 2 {
            return Err(FitError::InvalidState(
                "simplex has no vertices".to_string(),
            ));
        }
        let best = self.vertices[0].clone();
        let last = self.vertices.len() - 1;
        let c = self.centroid();

        // x_r = c + alpha*(c - x_worst)
        let t = linear_combination(1.0 + self.alpha, &c, -self.alpha, &self.vertices[last].parameters);
        let mut r = self.step_towards(&c, &t)?;
        log::trace!("simplex reflection: {}", r.residuals);

        if r.is_better_than(&best) {
            // x_e = c + beta * (x_r - c)
            let t = linear_combination(1.0 - self.beta, &c, self.beta, &r.parameters);
            if let Ok(e) = self.step_towards(&c, &t) {
                log::trace!("simplex expansion: {}", e.residuals);
                if e.is_better_than(&r) {
                    r = e;
                }
            }
            self.vertices[last] = r;
        } else if r.is_better_than(&self.vertices[last - 1]) {
            // better than the second worst
            self.vertices[last] = r;
        } else {
            let shrink = if self.vertices[last].is_better_than(&r) {
                // x_ic = c - gamma * (x_r - c)
                let t = linear_combination(1.0 + self.gamma, &c, -self.gamma, &r.parameters);
                let nt = self.step_towards(&c, &t)?;
                log::trace!("simplex inner contraction: {}", nt.residuals);
                if nt.is_better_than(&self.vertices[last]) {
                    self.vertices[last] = nt;
                    false
                } else {
                    true
                }
            } else {
                // x_oc = c + gamma * (x_r - c)
                let t = linear_combination(1.0 - self.gamma, &c, self.gamma, &r.parameters);
                let nt = self.step_towards(&c, &t)?;
                log::trace!("simplex outer contraction: {}", nt.residuals);
                if nt.is_better_than(&r) || nt == r {
                    self.vertices[last] = nt;
                    false
                } else {
                    true
                }
            };

            if shrink {
                log::trace!("simplex shrink");
                for i in 1..self.vertices.len() {
                    // x_i = x_best + delta * (x_i - x_best)
                    let t = linear_combination(
                        1.0 - self.delta,
                        &best.parameters,
                        self.delta,
                        &self.vertices[i].parameters,
                    );
                    self.vertices[i] = self.step_towards(&best.parameters, &t)?;
                }
            }
        }
        self.sort();

        let new_best = &self.vertices[0].parameters;
        if *new_best == best.parameters {
            return Ok(IterationStatus::Continue);
        }
        for (n, o) in new_best.iter().zip(best.parameters.iter()) {
            let change = if *o != 0.0 { ((n - o) / o).abs() } else { (n - o).abs() };
            if change > self.threshold {
                return Ok(IterationStatus::Continue);
            }
        }
        Ok(IterationStatus::Success)
    }
}

/// Option schema of the simplex engine.
pub fn simplex_options() -> Vec<EngineOptionSpec> {
    vec![
        EngineOptionSpec::number("alpha", "Reflection factor"),
        EngineOptionSpec::number("beta", "Expansion factor"),
        EngineOptionSpec::number("gamma", "Contraction factor"),
        EngineOptionSpec::number("delta", "Shrink factor"),
        EngineOptionSpec::number("end-threshold", "Relative change of the best vertex for ending"),
        EngineOptionSpec::number("initial-factor", "Factor used to build the initial vertices"),
        EngineOptionSpec::number("backoff-threshold", "Smallest step fraction tried on invalid points"),
        EngineOptionSpec::flag("scaling", "Divide each parameter by its initial magnitude"),
    ]
}

type Objective = Box<dyn Fn(&Array1<f64>) -> Result<f64> + Send>;

/// The Nelder-Mead fit engine.
pub struct SimplexEngine {
    base: EngineBase,
    simplex: Simplex<Objective>,
    initial_factor: f64,
    scaling: bool,
    /// Per-parameter scale: the simplex works on `x / scales`.
    scales: Arc<std::sync::RwLock<Array1<f64>>>,
    current: Array1<f64>,
}

impl SimplexEngine {
    pub fn new(context: Arc<FitContext>) -> Self {
        let scales = Arc::new(std::sync::RwLock::new(Array1::ones(context.free_parameters())));
        let ctx = Arc::clone(&context);
        let sc = Arc::clone(&scales);
        let objective: Objective = Box::new(move |u: &Array1<f64>| {
            let x = match sc.read() {
                Ok(s) => u * &*s,
                Err(poisoned) => u * &*poisoned.into_inner(),
            };
            Ok(StoredParameters::evaluate(&ctx, x)?.residuals)
        });
        Self {
            base: EngineBase::new(context),
            simplex: Simplex::new(objective),
            initial_factor: 2.0,
            scaling: false,
            scales,
            current: Array1::zeros(0),
        }
    }

    fn unscaled(&self, u: &Array1<f64>) -> Array1<f64> {
        match self.scales.read() {
            Ok(s) => u * &*s,
            Err(poisoned) => u * &*poisoned.into_inner(),
        }
    }

    fn update_current(&mut self) {
        if let Some(best) = self.simplex.vertices.first() {
            self.current = self.unscaled(&best.parameters);
        }
    }
}

impl FitEngine for SimplexEngine {
    fn name(&self) -> &'static str {
        "simplex"
    }

    fn initialize(&mut self, initial_guess: &[f64]) -> Result<()> {
        let x0 = self.base.pack(initial_guess)?;
        let scales = if self.scaling {
            x0.mapv(|v| if v != 0.0 { v.abs() } else { 1.0 })
        } else {
            Array1::ones(x0.len())
        };
        let u0 = &x0 / &scales;
        match self.scales.write() {
            Ok(mut s) => *s = scales,
            Err(poisoned) => *poisoned.into_inner() = scales,
        }
        self.current = x0;
        self.simplex.initialize(&u0, self.initial_factor)?;
        self.update_current();
        self.base.initialized();
        Ok(())
    }

    fn iterate(&mut self) -> Result<IterationStatus> {
        self.base.begin_iteration()?;
        let outcome = self.simplex.iterate();
        self.update_current();
        self.base.finish_iteration(outcome)
    }

    fn current_parameters(&self) -> &Array1<f64> {
        &self.current
    }

    fn residuals(&self) -> f64 {
        self.simplex
            .vertices
            .first()
            .map_or(f64::NAN, |v| v.residuals.sqrt())
    }

    fn compute_covariance_matrix(&mut self) -> Result<Array2<f64>> {
        super::covariance_at(&self.base.context, &self.current)
    }

    fn state(&self) -> EngineState {
        self.base.state
    }

    fn iterations(&self) -> usize {
        self.base.iterations
    }

    fn engine_options(&self) -> EngineOptions {
        EngineOptions::new()
            .with("alpha", self.simplex.alpha)
            .with("beta", self.simplex.beta)
            .with("gamma", self.simplex.gamma)
            .with("delta", self.simplex.delta)
            .with("end-threshold", self.simplex.threshold)
            .with("initial-factor", self.initial_factor)
            .with("backoff-threshold", self.simplex.backoff_threshold)
            .with("scaling", if self.scaling { 1.0 } else { 0.0 })
    }

    fn set_engine_options(&mut self, options: &EngineOptions) -> Result<()> {
        options.validate(&simplex_options())?;
        options.update("alpha", &mut self.simplex.alpha);
        options.update("beta", &mut self.simplex.beta);
        options.update("gamma", &mut self.simplex.gamma);
        options.update("delta", &mut self.simplex.delta);
        options.update("end-threshold", &mut self.simplex.threshold);
        options.update("initial-factor", &mut self.initial_factor);
        options.update("backoff-threshold", &mut self.simplex.backoff_threshold);
        options.update_bool("scaling", &mut self.scaling);
        Ok(())
    }
}
