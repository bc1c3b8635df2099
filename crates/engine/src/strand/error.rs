//! Step failure classification

use std::time::Duration;

use crate::persistence::StoreError;

use super::StepOutcome;

/// Error a step returns instead of an outcome
///
/// - `Validation`: preconditions not met. At assemble time this rejects the
///   strand before it exists; inside a running step it halts the strand.
/// - `Retryable`: transient failure of a domain action. The dispatcher turns
///   it into a suspend with backoff.
/// - `Fatal`: unrecoverable. The strand halts for operator intervention.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("retryable failure: {message}")]
    Retryable {
        message: String,

        /// Explicit backoff, overriding the dispatcher's retry policy
        backoff: Option<Duration>,
    },

    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl StepError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Retryable failure using the policy's backoff
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            backoff: None,
        }
    }

    /// Retryable failure with an explicit backoff
    pub fn retry_after(message: impl Into<String>, backoff: Duration) -> Self {
        Self::Retryable {
            message: message.into(),
            backoff: Some(backoff),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

// Ad-hoc domain errors (remote commands, HTTP calls) are transient by default
impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(_) => Self::retryable(err.to_string()),
            _ => Self::fatal(err.to_string()),
        }
    }
}

/// Result of running one step
pub type StepResult = Result<StepOutcome, StepError>;
