//! # Parameter Model
//!
//! This module defines how the natural-scale parameters of a model map onto
//! the compact vector an optimizer works with.
//!
//! ## Key Features
//!
//! - **Global and per-dataset parameters**: a global parameter has a single
//!   value shared by every dataset of a multi-dataset fit
//! - **Fixed parameters**: constant during optimization, no optimizer slot
//! - **Formula parameters**: computed from the other parameters of the same
//!   dataset each time parameters are unpacked, in dependency order
//! - **Bijections**: free parameters may be seen by the optimizer through a
//!   log or range transform
//!
//! ## Core Components
//!
//! - [`ParameterDefinition`]: immutable descriptor supplied by the model
//! - [`FitParameter`]: one parameter of a fit, with its [`ParameterKind`]
//! - [`Bijection`]: transforms between optimizer and natural space
//! - [`FormulaCompiler`]: the expression evaluator contract, implemented by
//!   [`ExpressionCompiler`]
//!
//! ## Example Usage
//!
//! ```rust
//! use multifit_rs::parameters::{ExpressionCompiler, FitParameter};
//!
//! let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
//! let mut a = FitParameter::free(0, None);
//! a.fit_index = Some(0);
//! let b = FitParameter::fixed(1, None, 1.0);
//! let mut c = FitParameter::formula(2, None, "a + b");
//! c.initialize(&names, &ExpressionCompiler).unwrap();
//!
//! let mut natural = vec![0.0; 3];
//! for p in [&a, &b, &c] {
//!     p.copy_to_unpacked(&mut natural, &[2.0], 1, 3).unwrap();
//! }
//! assert_eq!(natural, vec![2.0, 1.0, 3.0]);
//! ```

pub mod bijection;
pub mod definition;
pub mod expression;
pub mod fit_parameter;
pub mod ordering;

pub use bijection::Bijection;
pub use definition::{definitions, ParameterDefinition};
pub use expression::{CompiledFormula, Expression, ExpressionCompiler, FormulaCompiler};
pub use fit_parameter::{FitParameter, FixedValue, FormulaParameter, FreeParameter, ParameterKind};
pub use ordering::formula_order;
