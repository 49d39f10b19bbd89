use thiserror::Error;

/// Error types for the multifit-rs library.
///
/// The variants follow how a failure must be handled: domain errors are
/// raised by model functions for invalid parameter combinations and are
/// recoverable, numerical errors end one engine run, and structural errors
/// abort the setup of a fit.
#[derive(Error, Debug)]
pub enum FitError {
    /// The model function cannot be evaluated at this point (for instance a
    /// negative rate constant). Engines reject the trial point and go on.
    #[error("Domain error: {0}")]
    Domain(String),

    /// Singular systems, divergence or exhausted retry counters.
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// Inconsistent setup: parameter count mismatch, cyclic formulas,
    /// negative degrees of freedom and the like.
    #[error("Structural error: {0}")]
    Structural(String),

    /// A formula could not be compiled or refers to an unknown name.
    #[error("Expression error: {0}")]
    Expression(String),

    /// No engine registered under that name.
    #[error("Unknown fit engine: {0}")]
    UnknownEngine(String),

    /// An engine option does not exist or has an invalid value.
    #[error("Invalid engine option: {0}")]
    InvalidOption(String),

    /// Another fit already holds the single-active-fit slot.
    #[error("Another fit is already running on a non-reentrant engine")]
    ActiveFitBusy,

    /// The engine was used before being initialized.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed trajectory record.
    #[error("Trajectory error: {0}")]
    Trajectory(String),

    /// I/O error wrapper.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Tab-separated trajectory file error.
    #[error("TSV error: {0}")]
    CsvError(#[from] csv::Error),
}

impl FitError {
    /// Whether an engine may reject the current trial point and keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FitError::Domain(_))
    }

    /// Whether the error must abort the setup of a fit.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            FitError::Structural(_) | FitError::Expression(_) | FitError::Trajectory(_)
        )
    }
}

/// Result type alias for multifit-rs operations.
pub type Result<T> = std::result::Result<T, FitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FitError::Domain("negative rate constant".to_string());
        assert!(format!("{}", err).contains("negative rate constant"));

        let err = FitError::Structural("expected 3 parameters, got 2".to_string());
        assert!(format!("{}", err).contains("expected 3 parameters, got 2"));
    }

    #[test]
    fn test_error_classes() {
        assert!(FitError::Domain(String::new()).is_recoverable());
        assert!(!FitError::Numerical(String::new()).is_recoverable());
        assert!(FitError::Expression("x".into()).is_structural());
        assert!(!FitError::ActiveFitBusy.is_structural());
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: FitError = io_err.into();

        match err {
            FitError::IoError(_) => (),
            _ => panic!("Expected IoError variant"),
        }
    }
}
