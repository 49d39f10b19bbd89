//! Configuration of a fit run.

use crate::engines::EngineOptions;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Configuration options for running a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FitConfig {
    /// Name of the engine, as registered. Default: "qsoas"
    pub engine: String,

    /// Jacobian worker threads. Positive for a fixed count, zero or
    /// negative for all logical cores but that many. Default: 0
    pub threads: i32,

    /// Maximum number of engine iterations. Default: 50
    pub max_iterations: usize,

    /// Weight residuals by per-point standard errors when every dataset
    /// has them. Default: true
    pub use_errors: bool,

    /// Relative singular value threshold of the covariance pseudo-inverse.
    /// Default: 1e-7
    pub svd_threshold: f64,

    /// Fit independent datasets separately and concurrently. Default: true
    pub split_independent: bool,

    /// Engine-specific options.
    pub engine_options: EngineOptions,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            engine: "qsoas".to_string(),
            threads: 0,
            max_iterations: 50,
            use_errors: true,
            svd_threshold: 1e-7,
            split_independent: true,
            engine_options: EngineOptions::default(),
        }
    }
}

impl FitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(mut self, engine: &str) -> Self {
        self.engine = engine.to_string();
        self
    }

    pub fn with_threads(mut self, threads: i32) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_use_errors(mut self, use_errors: bool) -> Self {
        self.use_errors = use_errors;
        self
    }

    pub fn with_svd_threshold(mut self, threshold: f64) -> Self {
        self.svd_threshold = threshold;
        self
    }

    pub fn with_split_independent(mut self, split: bool) -> Self {
        self.split_independent = split;
        self
    }

    pub fn with_option(mut self, name: &str, value: f64) -> Self {
        self.engine_options.set(name, value);
        self
    }

    /// Reads a configuration from JSON; missing fields take their default.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
