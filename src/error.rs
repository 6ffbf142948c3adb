//! Application error types.
//!
//! Driver failures keep their own [`StcError`] (with errno mapping); this
//! enum wraps them together with the configuration and runtime failures of
//! the command-line front end.

use daq_driver_stc::StcError;
use thiserror::Error;

/// Errors raised by the `stc-daq` application layer.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed semantic validation.
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// Tracing subscriber could not be installed.
    #[error("Logging initialisation failed: {0}")]
    Logging(String),

    /// Error from the driver core.
    #[error("Driver error: {0}")]
    Driver(#[from] StcError),

    /// A scenario produced an unexpected result.
    #[error("Scenario '{scenario}' failed: {reason}")]
    Scenario {
        /// Scenario name
        scenario: &'static str,
        /// What went wrong
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Negative errno of the underlying driver error, if there is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            AppError::Driver(err) => Some(err.errno()),
            _ => None,
        }
    }

    pub(crate) fn scenario(scenario: &'static str, reason: impl Into<String>) -> Self {
        AppError::Scenario {
            scenario,
            reason: reason.into(),
        }
    }
}

/// Result alias for application operations.
pub type AppResult<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_errno_passes_through() {
        let err = AppError::from(StcError::WouldBlock);
        assert_eq!(err.errno(), Some(-daq_driver_stc::error::EAGAIN));
        assert!(err.to_string().starts_with("Driver error"));
    }

    #[test]
    fn test_validation_has_no_errno() {
        let err = AppError::Validation("log_level".into());
        assert_eq!(err.errno(), None);
    }
}
