// src/error.rs
//! Error types shared across the toolkit

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result type for toolkit operations
pub type KinetResult<T> = Result<T, KinetError>;

/// A user-supplied error, as hook and task signatures accept it
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A failure cause shared by every promise or service that depends on it
pub type FailureCause = Arc<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by promises, services, executors and limiters
#[derive(Error, Debug, Clone)]
pub enum KinetError {
    /// The computation produced an exceptional value
    #[error("computation failed: {0}")]
    Failed(FailureCause),

    /// The computation was cancelled
    #[error("computation was cancelled")]
    Cancelled,

    /// The waiting thread was interrupted
    #[error("wait was interrupted")]
    Interrupted,

    /// A bounded wait expired
    #[error("wait timed out")]
    Timeout,

    /// An operation was used in a state it is not valid for
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The delegate executor refused a task
    #[error("task rejected: {0}")]
    Rejected(String),
}

impl KinetError {
    /// The failure cause, if this error carries one
    pub fn cause(&self) -> Option<&FailureCause> {
        match self {
            KinetError::Failed(cause) => Some(cause),
            _ => None,
        }
    }
}

/// Cause recorded when user code panics inside a task, listener or hook.
///
/// Panics are the unrecoverable-error class of the toolkit: combinators that
/// swallow ordinary failures still log these.
pub struct PanicCause {
    message: String,
}

impl PanicCause {
    /// Capture the payload of an unwound panic
    pub fn new(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }

    /// The panic message, best-effort
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for PanicCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicCause")
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for PanicCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

impl std::error::Error for PanicCause {}

/// Wrap a panic payload as a shareable failure cause
pub fn panic_cause(payload: Box<dyn Any + Send>) -> FailureCause {
    Arc::new(PanicCause::new(payload))
}

/// True when a failure cause records a panic rather than an ordinary error
pub fn is_panic(cause: &FailureCause) -> bool {
    cause.downcast_ref::<PanicCause>().is_some()
}

/// Wrap a user error as a shareable failure cause
pub fn into_cause(err: BoxError) -> FailureCause {
    Arc::from(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_cause_extracts_str_payload() {
        let cause = panic_cause(Box::new("boom"));
        assert!(is_panic(&cause));
        assert_eq!(cause.to_string(), "panic: boom");
    }

    #[test]
    fn panic_cause_extracts_string_payload() {
        let cause = panic_cause(Box::new("later".to_string()));
        assert_eq!(cause.to_string(), "panic: later");
    }

    #[test]
    fn ordinary_cause_is_not_a_panic() {
        let cause = into_cause("io broke".into());
        assert!(!is_panic(&cause));
    }

    #[test]
    fn failed_error_exposes_cause() {
        let cause = into_cause("inner".into());
        let err = KinetError::Failed(cause);
        assert!(err.cause().is_some());
        assert!(KinetError::Timeout.cause().is_none());
    }
}
