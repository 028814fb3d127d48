//! # Error Taxonomy
//!
//! Unified error kinds for the execution engine. The taxonomy is deliberately
//! small and maps directly onto the HTTP responses the ingress layer returns
//! and the retry policy the engine applies internally.

use thiserror::Error;
use uuid::Uuid;

/// Engine-wide result type.
pub type EngineResult<T> = Result<T, EngineError>;

/// Error kinds the engine surfaces. Variant choice determines both the
/// HTTP status the ingress maps it to and whether internal callers retry.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input; never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Subject (run, task, step) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid state transition, contradictory seal, or duplicate idempotency
    /// key with a different payload.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing or incorrect callback secret.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Retriable infrastructure failure in the store gateway.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Invariant violation. The affected run is marked failed; the process
    /// continues running.
    #[error("fatal invariant violation in {context}: {reason}")]
    Fatal { context: String, reason: String },
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(subject: impl Into<String>) -> Self {
        Self::NotFound(subject.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn fatal(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fatal {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub fn task_not_found(task_uuid: Uuid) -> Self {
        Self::NotFound(format!("task {task_uuid}"))
    }

    pub fn run_not_found(run_uuid: Uuid) -> Self {
        Self::NotFound(format!("run {run_uuid}"))
    }

    /// Whether a caller should retry the operation that produced this error.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// The HTTP status code the ingress layer maps this error onto.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::StoreUnavailable(_) => 503,
            Self::Fatal { .. } => 500,
        }
    }
}
