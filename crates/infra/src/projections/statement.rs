//! Idempotent write operations produced by folding events.
//!
//! One event folds to zero-or-one statement. Statements are tagged with the
//! event's `(sequence, position)` so the handler can advance its watermark in
//! the same atomic step that applies them.

use keyforge_core::Position;

/// A column-level change merged into an existing row.
///
/// Partial events (an email verification, a data patch) cannot produce a full
/// replacement row; they carry a change instead, applied to whatever the row
/// currently holds. A change against an absent row is a no-op, which keeps
/// re-delivery after a deletion harmless.
pub trait RowChange<V>: Send + Sync {
    fn apply_to(&self, row: &mut V);
}

/// Change type for projections whose events always carry the full row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoChanges {}

impl<V> RowChange<V> for NoChanges {
    fn apply_to(&self, _row: &mut V) {
        match *self {}
    }
}

/// A single idempotent write against a read-model table.
///
/// Never a raw insert: creation maps to an upsert keyed by the row's natural
/// key, so re-delivery cannot conflict.
#[derive(Debug, Clone)]
pub enum RowOp<K, V, C> {
    /// Insert the row or replace it wholesale.
    Upsert { key: K, row: V },
    /// Merge a column-level change into an existing row.
    Change { key: K, change: C },
    /// Delete the row by natural key.
    Delete { key: K },
}

/// A row operation tagged with its originating event's order tokens.
#[derive(Debug, Clone)]
pub struct Statement<K, V, C> {
    pub sequence: u64,
    pub position: Position,
    pub op: RowOp<K, V, C>,
}
