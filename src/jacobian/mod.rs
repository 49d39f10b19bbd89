//! Concurrent numerical Jacobian evaluation.
//!
//! The Jacobian of a fit is computed one column (one free parameter) per
//! job by finite differences. Jobs go through a bounded [`JobQueue`] to a
//! pool of worker threads ([`JacobianEvaluator`]); results end up in a
//! [`SparseJacobian`], which knows which blocks are zero by construction.

pub mod pool;
pub mod queue;
pub mod sparse;

pub use pool::{evaluate_sequential, resolve_thread_count, DerivativeJob, JacobianEvaluator};
pub use queue::{JobQueue, Terminated};
pub use sparse::SparseJacobian;
