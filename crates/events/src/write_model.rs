//! Write-model fold base.
//!
//! A write model is the ephemeral, command-scoped fold of one aggregate's
//! event history into typed state. It is rebuilt per command, mutated only by
//! folding events in sequence order, and discarded when the command ends.

use serde_json::Value as JsonValue;

use keyforge_core::{AggregateId, DomainError, DomainResult, InstanceId, OrgId, Position};

use crate::EventEnvelope;

/// Stream bookkeeping shared by all write models.
///
/// Tracks the aggregate identity and the last folded `(sequence, position)`.
/// `fold_next` is the single place the stream-order invariant is enforced:
/// duplicates, gaps, and out-of-order events are `CorruptedStream`, never
/// silently tolerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteModelState {
    instance_id: InstanceId,
    aggregate_id: AggregateId,
    resource_owner: Option<OrgId>,
    sequence: u64,
    position: Position,
    changed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl WriteModelState {
    pub fn new(instance_id: InstanceId, aggregate_id: AggregateId) -> Self {
        Self {
            instance_id,
            aggregate_id,
            resource_owner: None,
            sequence: 0,
            position: Position::ZERO,
            changed_at: None,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    /// Resource owner, learned from the first folded event.
    pub fn resource_owner(&self) -> Option<OrgId> {
        self.resource_owner
    }

    /// Last folded sequence (0 for an empty stream).
    ///
    /// This is the value to use as the optimistic-concurrency guard when
    /// appending events produced against this state.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn position(&self) -> Position {
        self.position
    }

    /// Creation date of the last folded event.
    pub fn changed_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.changed_at
    }

    /// Account for one envelope, enforcing stream invariants.
    ///
    /// Invariants checked:
    /// - envelope targets this aggregate and instance
    /// - sequence is exactly `last + 1` (no gaps, no duplicates, no reordering)
    pub fn fold_next(&mut self, envelope: &EventEnvelope<JsonValue>) -> DomainResult<()> {
        if envelope.instance_id() != self.instance_id {
            return Err(DomainError::corrupted(format!(
                "envelope instance_id {} does not match write model instance_id {}",
                envelope.instance_id(),
                self.instance_id
            )));
        }
        if envelope.aggregate_id() != self.aggregate_id {
            return Err(DomainError::corrupted(format!(
                "envelope aggregate_id {} does not match write model aggregate_id {}",
                envelope.aggregate_id(),
                self.aggregate_id
            )));
        }
        if envelope.sequence() != self.sequence + 1 {
            return Err(DomainError::corrupted(format!(
                "non-contiguous sequence (last={}, found={})",
                self.sequence,
                envelope.sequence()
            )));
        }

        if self.resource_owner.is_none() {
            self.resource_owner = Some(envelope.resource_owner());
        }
        self.sequence = envelope.sequence();
        self.position = envelope.position();
        self.changed_at = Some(envelope.created_at());
        Ok(())
    }
}

/// Aggregate write model: fold + state inspection.
///
/// Implementations dispatch on `envelope.event_type()` inside `apply` and
/// **ignore** unknown event types (forward compatibility). Ordering checks do
/// not belong in `apply`; `reduce` runs them through the shared state first.
pub trait WriteModel {
    /// Aggregate type this model folds (e.g. "user").
    fn aggregate_type(&self) -> &'static str;

    fn state(&self) -> &WriteModelState;

    fn state_mut(&mut self) -> &mut WriteModelState;

    /// Fold one event's payload into typed state. Unknown types are a no-op.
    fn apply(&mut self, envelope: &EventEnvelope<JsonValue>) -> DomainResult<()>;

    /// True iff a creation event folded and no terminal deletion followed.
    fn exists(&self) -> bool;

    /// Fold events strictly in ascending sequence order.
    fn reduce<'a>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<JsonValue>>,
    ) -> DomainResult<()> {
        for envelope in envelopes {
            self.state_mut().fold_next(envelope)?;
            self.apply(envelope)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keyforge_core::UserId;
    use uuid::Uuid;

    fn envelope(
        instance_id: InstanceId,
        aggregate_id: AggregateId,
        sequence: u64,
        position: u64,
    ) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            instance_id,
            OrgId::new(),
            aggregate_id,
            "test.aggregate",
            sequence,
            Position::new(position),
            "test.noop",
            UserId::new(),
            Utc::now(),
            JsonValue::Null,
        )
    }

    #[test]
    fn fold_next_tracks_sequence_and_owner() {
        let instance_id = InstanceId::new();
        let aggregate_id = AggregateId::new();
        let mut state = WriteModelState::new(instance_id, aggregate_id);
        assert_eq!(state.sequence(), 0);
        assert!(state.resource_owner().is_none());

        state.fold_next(&envelope(instance_id, aggregate_id, 1, 7)).unwrap();
        state.fold_next(&envelope(instance_id, aggregate_id, 2, 9)).unwrap();

        assert_eq!(state.sequence(), 2);
        assert_eq!(state.position(), Position::new(9));
        assert!(state.resource_owner().is_some());
    }

    #[test]
    fn fold_next_rejects_gaps_duplicates_and_reordering() {
        let instance_id = InstanceId::new();
        let aggregate_id = AggregateId::new();
        let mut state = WriteModelState::new(instance_id, aggregate_id);
        state.fold_next(&envelope(instance_id, aggregate_id, 1, 1)).unwrap();

        for bad in [1u64, 3, 0] {
            let err = state
                .fold_next(&envelope(instance_id, aggregate_id, bad, 2))
                .unwrap_err();
            assert!(matches!(err, DomainError::CorruptedStream(_)));
        }
    }

    #[test]
    fn fold_next_rejects_foreign_streams() {
        let instance_id = InstanceId::new();
        let aggregate_id = AggregateId::new();
        let mut state = WriteModelState::new(instance_id, aggregate_id);

        let err = state
            .fold_next(&envelope(instance_id, AggregateId::new(), 1, 1))
            .unwrap_err();
        assert!(matches!(err, DomainError::CorruptedStream(_)));

        let err = state
            .fold_next(&envelope(InstanceId::new(), aggregate_id, 1, 1))
            .unwrap_err();
        assert!(matches!(err, DomainError::CorruptedStream(_)));
    }
}
