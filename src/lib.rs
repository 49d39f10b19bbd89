//! # multifit-rs
//!
//! `multifit-rs` fits nonlinear models to several datasets at once, with
//! parameters that can be shared between datasets (global), held constant
//! (fixed) or computed from the others (formulas).
//!
//! The library provides:
//! - A parameter model mapping natural parameters onto the compact vector
//!   seen by the optimizers, with log and range bijections
//! - A fit context computing weighted residuals and a numerical Jacobian
//!   evaluated concurrently by a pool of worker threads
//! - Interchangeable engines selected by name: Levenberg-Marquardt variants,
//!   Nelder-Mead simplex, particle swarm and orthogonal distance regression
//! - Covariance matrices, standard errors and confidence intervals
//! - Fit trajectories for exploring the parameter space from many starts
//!
//! ## Basic Usage
//!
//! ```
//! use multifit_rs::{DataSet, Dataset, FitConfig, FitContext, Fitter};
//! use multifit_rs::models::linear_model;
//! use ndarray::array;
//! use std::sync::Arc;
//!
//! let data = DataSet::from_fn(array![0.0, 1.0, 2.0, 3.0], |x| 2.0 * x + 1.0);
//! let datasets: Vec<Arc<dyn Dataset>> = vec![Arc::new(data)];
//! let mut context = FitContext::new(Arc::new(linear_model("")), datasets).unwrap();
//! context.initialize(&[1.0, 0.0]).unwrap();
//!
//! let fitter = Fitter::new(Arc::new(context), FitConfig::default());
//! let outcome = fitter.run(&[1.0, 0.0]).unwrap();
//! assert!(outcome.converged());
//! assert!((outcome.parameters[0] - 2.0).abs() < 1e-6);
//! ```

// Public modules
pub mod config;
pub mod data;
pub mod driver;
pub mod engines;
pub mod error;
pub mod fit;
pub mod jacobian;
pub mod model;
pub mod models;
pub mod parameters;
pub mod trajectory;
pub mod uncertainty;
pub mod utils;

// Re-exports for convenience
pub use config::FitConfig;
pub use data::{DataSet, Dataset};
pub use driver::{FitOutcome, Fitter};
pub use engines::{default_registry, EngineOptions, EngineRegistry, FitEngine, IterationStatus};
pub use error::{FitError, Result};
pub use fit::FitContext;
pub use model::{FunctionModel, ModelFunction};
pub use parameters::{Bijection, ParameterDefinition};
pub use trajectory::{Ending, FitTrajectories, FitTrajectory};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
