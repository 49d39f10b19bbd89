//! Built-in model functions.
//!
//! Ready-made [`ModelFunction`](crate::model::ModelFunction)s for common
//! fitting problems. Custom models either implement the trait directly or
//! wrap a point-wise closure in a
//! [`FunctionModel`](crate::model::FunctionModel).

mod exponential;
mod polynomial;

pub use exponential::ExponentialDecayModel;
pub use polynomial::{LinearModel, PolynomialModel};

/// A straight line, `slope * x + intercept`.
pub fn linear_model(prefix: &str) -> LinearModel {
    LinearModel::new(prefix)
}

/// A polynomial of the given degree.
pub fn polynomial_model(prefix: &str, degree: usize) -> PolynomialModel {
    PolynomialModel::new(prefix, degree)
}

/// An exponential decay, `amplitude * exp(-rate * (x - x0)) + baseline`.
pub fn exponential_decay_model(prefix: &str) -> ExponentialDecayModel {
    ExponentialDecayModel::new(prefix)
}
