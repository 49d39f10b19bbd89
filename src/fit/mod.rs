//! Fit contexts.
//!
//! A [`FitContext`] ties datasets, a model function and the fit parameters
//! together. It converts between optimizer and natural parameters, computes
//! weighted residuals and hands Jacobian columns to the worker pool.
//! [`FitCore`] is the frozen part shared with the workers.

mod context;
mod state;

pub use context::FitContext;
pub use state::FitCore;
