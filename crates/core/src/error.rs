//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures. Infrastructure
/// concerns belong elsewhere.
///
/// Retry policy by variant:
/// - `Conflict` is the only retryable failure (reload state, retry the command)
/// - `InvalidArgument`, `NotFound`, `PermissionDenied`, `PreconditionFailed`
///   are terminal for the call
/// - `CorruptedStream` is fatal and must never be silently continued
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The intent itself was malformed (structural, not business).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced aggregate/entity is absent or already deleted.
    #[error("not found")]
    NotFound,

    /// Authorization failure at the command boundary.
    #[error("permission denied")]
    PermissionDenied,

    /// A business rule was violated (e.g. schema field permission).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// An optimistic concurrency expectation no longer holds.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An invariant of the event stream itself was violated during a fold.
    #[error("corrupted stream: {0}")]
    CorruptedStream(String),
}

impl DomainError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::CorruptedStream(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    /// Whether the caller may retry after reloading state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
