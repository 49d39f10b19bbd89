//! Worker pool computing Jacobian columns in parallel.
//!
//! Each free parameter gives one job. A worker perturbs that parameter,
//! re-evaluates the residuals of the datasets it affects and stores the
//! finite-difference column in the job's own result slot, so no two
//! workers ever write the same column. The orchestrating thread waits on
//! the queue barrier, then copies the columns into the [`SparseJacobian`].

use super::queue::{JobQueue, Terminated};
use super::sparse::SparseJacobian;
use crate::error::{FitError, Result};
use crate::fit::FitCore;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};

/// Resolves a requested thread count.
///
/// A positive value is used as is. Zero or a negative value `-n` means
/// all logical cores but `n`, and never less than one.
pub fn resolve_thread_count(requested: i32) -> usize {
    if requested > 0 {
        return requested as usize;
    }
    let available = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    available
        .saturating_sub(requested.unsigned_abs() as usize)
        .max(1)
}

/// Result of one derivative job.
#[derive(Debug)]
enum ColumnOutcome {
    Done(Vec<f64>),
    /// The model raised a domain error (or panicked) at the perturbed point.
    Unavailable(String),
}

/// One column of the Jacobian to compute.
pub struct DerivativeJob {
    column: usize,
    core: Arc<FitCore>,
    parameters: Arc<Vec<f64>>,
    base: Arc<Vec<f64>>,
    results: Arc<Vec<OnceLock<ColumnOutcome>>>,
}

impl DerivativeJob {
    fn run(self) {
        let DerivativeJob {
            column,
            core,
            parameters,
            base,
            results,
        } = self;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            core.derivative_column(&parameters, &base, column, 1.0)
        }));
        let outcome = match outcome {
            Ok(Ok(values)) => ColumnOutcome::Done(values),
            Ok(Err(e)) => ColumnOutcome::Unavailable(e.to_string()),
            Err(_) => ColumnOutcome::Unavailable("model function panicked".to_string()),
        };
        // a slot is only ever written by the job owning it
        let _ = results[column].set(outcome);
    }
}

fn worker_loop(queue: Arc<JobQueue<DerivativeJob>>) {
    loop {
        let job = match queue.next_job() {
            Ok(job) => job,
            Err(Terminated) => break,
        };
        job.run();
        queue.done_job();
    }
}

/// A fixed-size pool of threads computing Jacobian columns.
pub struct JacobianEvaluator {
    queue: Arc<JobQueue<DerivativeJob>>,
    workers: Vec<JoinHandle<()>>,
    // one Jacobian evaluation at a time per pool
    batch: Mutex<()>,
}

impl JacobianEvaluator {
    /// Spawns `threads` workers.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when a thread cannot be spawned.
    pub fn new(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let queue = Arc::new(JobQueue::new(2 * threads));
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let q = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("jacobian-{}", i))
                .spawn(move || worker_loop(q));
            match handle {
                Ok(h) => workers.push(h),
                Err(e) => {
                    queue.terminate();
                    for w in workers {
                        let _ = w.join();
                    }
                    return Err(FitError::IoError(e));
                }
            }
        }
        log::debug!("started {} Jacobian worker threads", threads);
        Ok(Self {
            queue,
            workers,
            batch: Mutex::new(()),
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Total number of derivative jobs scheduled since creation.
    pub fn jobs_scheduled(&self) -> usize {
        self.queue.jobs_scheduled()
    }

    /// Computes the Jacobian of `core` at `parameters`, given the residuals
    /// `base` at that point.
    ///
    /// Columns whose job hit a domain error are recomputed on this thread
    /// with fallback steps; if none works the evaluation fails with a
    /// domain error.
    pub fn evaluate(
        &self,
        core: &Arc<FitCore>,
        parameters: &[f64],
        base: &[f64],
        target: &mut SparseJacobian,
    ) -> Result<()> {
        let _batch = self.batch.lock().unwrap_or_else(PoisonError::into_inner);
        let columns = core.free_parameters();
        let shared_parameters = Arc::new(parameters.to_vec());
        let shared_base = Arc::new(base.to_vec());
        let results: Arc<Vec<OnceLock<ColumnOutcome>>> =
            Arc::new((0..columns).map(|_| OnceLock::new()).collect());

        for column in 0..columns {
            let job = DerivativeJob {
                column,
                core: Arc::clone(core),
                parameters: Arc::clone(&shared_parameters),
                base: Arc::clone(&shared_base),
                results: Arc::clone(&results),
            };
            self.queue.enqueue(job).map_err(|_| {
                FitError::InvalidState("Jacobian pool was terminated".to_string())
            })?;
        }
        self.queue.wait_for_jobs_done();

        for (column, slot) in results.iter().enumerate() {
            match slot.get() {
                Some(ColumnOutcome::Done(values)) => target.set_column(column, values),
                Some(ColumnOutcome::Unavailable(reason)) => {
                    log::debug!(
                        "derivative of {} unavailable ({}), retrying",
                        core.describe_column(column),
                        reason
                    );
                    let values = core.derivative_column_with_retries(parameters, base, column)?;
                    target.set_column(column, &values);
                }
                None => {
                    return Err(FitError::InvalidState(format!(
                        "Jacobian column {} was never computed",
                        column
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Computes the Jacobian on the calling thread.
pub fn evaluate_sequential(
    core: &FitCore,
    parameters: &[f64],
    base: &[f64],
    target: &mut SparseJacobian,
) -> Result<()> {
    for column in 0..core.free_parameters() {
        let values = core.derivative_column_with_retries(parameters, base, column)?;
        target.set_column(column, &values);
    }
    Ok(())
}

impl Drop for JacobianEvaluator {
    fn drop(&mut self) {
        self.queue.terminate();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}
