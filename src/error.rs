//! Error types shared across the crate.
//!
//! Two families matter to callers:
//!
//! - [`CancelError`] is the reason-tagged error produced at every cancellation
//!   observation point (`check`, checkpoints, wrapped streams and callables).
//! - [`UsageError`] marks API misuse (double entry, duplicate registration,
//!   re-activating a consumed source) and always fails fast.
//!
//! [`RunError`] is what [`crate::operation::Operation::run`] returns: either a
//! cancellation, the body's own error unchanged, or a usage error from entry.

use crate::token::CancelReason;
use thiserror::Error;

/// Error raised when a cancellation has been observed.
///
/// Carries the reason and human message recorded on the token that fired, so
/// synchronous callers can distinguish a timeout from a manual stop without
/// reaching back into the operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation cancelled ({reason}): {message}")]
pub struct CancelError {
    /// Why the token fired.
    pub reason: CancelReason,
    /// Human-readable context supplied by whoever fired the token.
    pub message: String,
}

impl CancelError {
    pub fn new(reason: CancelReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// True when the cancellation came from a deadline source.
    pub fn is_timeout(&self) -> bool {
        self.reason == CancelReason::Timeout
    }
}

/// API misuse detected at a contract boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    /// `run`/`enter` called on an operation that already left `Pending`.
    #[error("operation {0} was already entered")]
    AlreadyEntered(String),

    /// An operation with this id is already registered.
    #[error("duplicate operation id: {0}")]
    DuplicateId(String),

    /// A source was activated into a second scope, or twice into one.
    #[error("source already active: {0}")]
    SourceAlreadyActive(String),

    /// A child operation was entered under a parent that is not running.
    #[error("parent operation {0} is not running")]
    ParentNotRunning(String),

    /// A source was constructed with invalid parameters.
    #[error("invalid source configuration: {0}")]
    InvalidSource(String),

    /// The requested facility is not available on this platform.
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),
}

/// Outcome of driving an operation body to completion.
///
/// The body's own error type `E` passes through unchanged; cancellation is
/// reported separately with the recorded reason and message.
#[derive(Debug, Error)]
pub enum RunError<E> {
    /// The operation's token fired and cancellation was delivered.
    #[error("operation cancelled ({reason}): {message}")]
    Cancelled {
        reason: CancelReason,
        message: String,
    },

    /// The body returned its own error; the operation exited `Failed`.
    #[error("operation failed: {0}")]
    Failed(E),

    /// Entering the operation was rejected.
    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl<E> RunError<E> {
    /// The cancellation reason, when this outcome is a cancellation.
    pub fn reason(&self) -> Option<CancelReason> {
        match self {
            RunError::Cancelled { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunError::Cancelled { .. })
    }
}

impl<E> From<CancelError> for RunError<E> {
    fn from(err: CancelError) -> Self {
        RunError::Cancelled {
            reason: err.reason,
            message: err.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_error_display_includes_reason_and_message() {
        let err = CancelError::new(CancelReason::Timeout, "deadline exceeded");
        let text = err.to_string();
        assert!(text.contains("timeout"), "unexpected display: {text}");
        assert!(text.contains("deadline exceeded"));
        assert!(err.is_timeout());
    }

    #[test]
    fn run_error_from_cancel_error_keeps_reason() {
        let err: RunError<std::io::Error> =
            CancelError::new(CancelReason::Manual, "stop").into();
        assert!(err.is_cancelled());
        assert_eq!(err.reason(), Some(CancelReason::Manual));
    }

    #[test]
    fn usage_error_display_names_the_operation() {
        let err = UsageError::AlreadyEntered("op-1".to_string());
        assert!(err.to_string().contains("op-1"));
    }
}
