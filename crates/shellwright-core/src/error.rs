//! Core error types for shellwright-core

use shellwright_exec::ExecError;
use thiserror::Error;

/// Errors raised while applying resources
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// The execution engine failed
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// A resource definition is inconsistent
    #[error("invalid resource {name}: {reason}")]
    InvalidResource {
        /// Resource name
        name: String,
        /// What is wrong with it
        reason: String,
    },
}

impl CoreError {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        CoreError::InvalidResource {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the failure came from cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Exec(ExecError::Cancelled))
    }
}
