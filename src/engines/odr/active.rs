//! The single active fit seen by the ODR callback.
//!
//! The batch solver calls back through a plain function pointer with no
//! user data, so the callback finds its fit here. Only one ODR fit may run
//! at a time in the whole process: activating a second one while the
//! first holds the slot fails with [`FitError::ActiveFitBusy`].

use crate::error::{FitError, Result};
use crate::fit::FitContext;
use std::sync::{Arc, Mutex, PoisonError};

struct ActiveFit {
    context: Arc<FitContext>,
    /// First error raised by the callback since activation.
    error: Option<FitError>,
}

static ACTIVE: Mutex<Option<ActiveFit>> = Mutex::new(None);

/// Holds the active slot; releases it when dropped.
#[derive(Debug)]
pub struct ActiveFitGuard {
    _private: (),
}

impl ActiveFitGuard {
    /// The error recorded by the callback, if any.
    pub fn take_error(&self) -> Option<FitError> {
        let mut slot = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_mut().and_then(|a| a.error.take())
    }
}

impl Drop for ActiveFitGuard {
    fn drop(&mut self) {
        let mut slot = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }
}

/// Makes `context` the active fit.
///
/// # Errors
///
/// [`FitError::ActiveFitBusy`] when another fit is active.
pub fn activate(context: Arc<FitContext>) -> Result<ActiveFitGuard> {
    let mut slot = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return Err(FitError::ActiveFitBusy);
    }
    *slot = Some(ActiveFit {
        context,
        error: None,
    });
    Ok(ActiveFitGuard { _private: () })
}

/// Whether some fit holds the slot.
pub fn is_active() -> bool {
    ACTIVE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

/// The active context. The lock is released before the caller uses it.
pub fn active_context() -> Option<Arc<FitContext>> {
    let slot = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
    slot.as_ref().map(|a| Arc::clone(&a.context))
}

/// Records an error raised inside the callback; the first one wins.
pub fn record_error(error: FitError) {
    let mut slot = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(active) = slot.as_mut() {
        if active.error.is_none() {
            active.error = Some(error);
        }
    }
}
