//! Bounded producer/consumer queue feeding the Jacobian workers.
//!
//! The orchestrating thread enqueues one job per Jacobian column and then
//! blocks on [`JobQueue::wait_for_jobs_done`]. Workers block in
//! [`JobQueue::next_job`] until a job is available or the queue is
//! terminated, in which case they get [`Terminated`] and exit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Returned to workers once the queue has been terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminated;

struct QueueState<T> {
    jobs: VecDeque<T>,
    remaining: usize,
    terminated: bool,
}

/// A bounded blocking job queue with a completion barrier.
pub struct JobQueue<T> {
    state: Mutex<QueueState<T>>,
    job_ready: Condvar,
    space_ready: Condvar,
    all_done: Condvar,
    capacity: usize,
    scheduled: AtomicUsize,
}

impl<T> JobQueue<T> {
    /// Create a queue holding at most `capacity` pending jobs.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::with_capacity(capacity.max(1)),
                remaining: 0,
                terminated: false,
            }),
            job_ready: Condvar::new(),
            space_ready: Condvar::new(),
            all_done: Condvar::new(),
            capacity: capacity.max(1),
            scheduled: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a job, blocking while the queue is full.
    ///
    /// The job counts as remaining until a worker calls
    /// [`done_job`](Self::done_job) for it.
    pub fn enqueue(&self, job: T) -> Result<(), Terminated> {
        let mut state = self.lock();
        while state.jobs.len() >= self.capacity && !state.terminated {
            state = self
                .space_ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.terminated {
            return Err(Terminated);
        }
        state.jobs.push_back(job);
        state.remaining += 1;
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        self.job_ready.notify_one();
        Ok(())
    }

    /// Takes the next job, blocking until one is available.
    pub fn next_job(&self) -> Result<T, Terminated> {
        let mut state = self.lock();
        loop {
            if state.terminated {
                return Err(Terminated);
            }
            if let Some(job) = state.jobs.pop_front() {
                self.space_ready.notify_one();
                return Ok(job);
            }
            state = self
                .job_ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Marks one job as finished.
    pub fn done_job(&self) {
        let mut state = self.lock();
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            self.all_done.notify_all();
        }
    }

    /// Blocks until every enqueued job has been marked done, or the queue
    /// is terminated.
    pub fn wait_for_jobs_done(&self) {
        let mut state = self.lock();
        while state.remaining > 0 && !state.terminated {
            state = self
                .all_done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Jobs enqueued and not yet done.
    pub fn remaining_jobs(&self) -> usize {
        self.lock().remaining
    }

    /// Total number of jobs ever enqueued.
    pub fn jobs_scheduled(&self) -> usize {
        self.scheduled.load(Ordering::Relaxed)
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    /// Wakes every blocked thread; workers then get [`Terminated`].
    pub fn terminate(&self) {
        let mut state = self.lock();
        state.terminated = true;
        state.jobs.clear();
        self.job_ready.notify_all();
        self.space_ready.notify_all();
        self.all_done.notify_all();
    }
}
