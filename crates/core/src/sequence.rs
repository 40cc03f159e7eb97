//! Ordering primitives: per-aggregate sequences and the global position.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Optimistic concurrency expectation against an aggregate stream.
///
/// The expectation refers to the **last persisted sequence** of the stream:
/// `Exact(0)` means "the stream must be empty".
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedSequence {
    /// Skip the check (idempotent commands, migrations).
    Any,
    /// Require the stream to be at an exact sequence.
    Exact(u64),
}

impl ExpectedSequence {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedSequence::Any => true,
            ExpectedSequence::Exact(s) => s == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

/// Globally comparable, monotonically increasing order token.
///
/// Sequences order events *within* one aggregate; positions order events
/// *across* aggregates of an instance. Projection watermarks are positions.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Position(u64);

impl Position {
    /// The position before any event: everything is "new" relative to it.
    pub const ZERO: Position = Position(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl core::fmt::Display for Position {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_sequence_matches() {
        assert!(ExpectedSequence::Any.matches(42));
        assert!(ExpectedSequence::Exact(0).matches(0));
        assert!(!ExpectedSequence::Exact(0).matches(1));
        assert!(ExpectedSequence::Exact(3).check(3).is_ok());
        assert!(matches!(
            ExpectedSequence::Exact(3).check(4),
            Err(DomainError::Conflict(_))
        ));
    }

    #[test]
    fn position_is_totally_ordered() {
        assert!(Position::ZERO < Position::new(1));
        assert_eq!(Position::new(1).next(), Position::new(2));
    }
}
