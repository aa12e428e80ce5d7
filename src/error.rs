//! Error types for a3s-warden

use thiserror::Error;

/// Errors that can occur inside the protection subsystem
///
/// None of these cross the `ProtectionCoordinator` facade: entry points
/// log them and degrade to a boolean or a report.
#[derive(Debug, Error)]
pub enum WardenError {
    /// A probe could not complete (permission denied, OS API unavailable)
    #[error("Detection failed in {probe}: {reason}")]
    Detection {
        probe: String,
        reason: String,
    },

    /// A corrective action failed (process already gone, file in use)
    #[error("Mitigation '{action}' failed: {reason}")]
    Mitigation {
        action: String,
        reason: String,
    },

    /// A single build attempt failed
    #[error("Build attempt {attempt} for '{target}' failed: {reason}")]
    BuildAttempt {
        target: String,
        attempt: u32,
        reason: String,
    },

    /// All build attempts were used up
    #[error("Build of '{target}' failed after {attempts} attempts")]
    ExhaustedRetries {
        target: String,
        attempts: u32,
    },

    /// Health stayed critical after emergency protections; no attempt was made
    #[error("Build of '{target}' refused: health stayed critical")]
    BuildRefused {
        target: String,
    },

    /// Coordinator initialization failure
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Filesystem or process I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Shorthand for a detection failure
    pub fn detection(probe: impl Into<String>, reason: impl ToString) -> Self {
        WardenError::Detection {
            probe: probe.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a mitigation failure
    pub fn mitigation(action: impl Into<String>, reason: impl ToString) -> Self {
        WardenError::Mitigation {
            action: action.into(),
            reason: reason.to_string(),
        }
    }
}

/// Message carried by a caught panic payload
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl From<hcl::Error> for WardenError {
    fn from(e: hcl::Error) -> Self {
        WardenError::Config(e.to_string())
    }
}

/// Result type alias for warden operations
pub type Result<T> = std::result::Result<T, WardenError>;
