use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use keyforge_core::{AggregateId, ExpectedSequence, InstanceId, OrgId, Position, UserId};
use std::sync::Arc;

use super::search::{EventPage, SearchQuery};

/// An event draft, ready to be appended (no sequence/position assigned yet).
///
/// The store assigns `sequence`, `position` and the creation date during
/// append; callers only describe the fact and who caused it.
///
/// Use [`UncommittedEvent::from_typed`] to build a draft from a typed domain
/// event: it serializes the payload and captures the event type tag needed
/// for later dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub instance_id: InstanceId,
    pub resource_owner: OrgId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub editor: UserId,

    pub payload: JsonValue,
}

/// A committed event in an append-only stream.
///
/// `sequence` is per-aggregate, contiguous, 1-based, assigned by the store.
/// `position` is the instance-global order token used for projection
/// catch-up. Both are immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub instance_id: InstanceId,
    pub resource_owner: OrgId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub sequence: u64,
    pub position: Position,

    pub event_type: String,
    pub event_version: u32,
    pub editor: UserId,
    pub created_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    /// Convert a stored event into an envelope for folding or publication.
    pub fn to_envelope(&self) -> keyforge_events::EventEnvelope<JsonValue> {
        keyforge_events::EventEnvelope::new(
            self.event_id,
            self.instance_id,
            self.resource_owner,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence,
            self.position,
            self.event_type.clone(),
            self.editor,
            self.created_at,
            self.payload.clone(),
        )
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, isolation) as
/// opposed to domain errors (validation, invariants).
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Optimistic concurrency check failed: a guard no longer matches the
    /// latest persisted sequence. Recoverable by reload + retry.
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    /// Cross-instance access attempted (isolation violation).
    #[error("instance isolation violation: {0}")]
    InstanceIsolation(String),

    /// Event aggregate type does not match the stream's aggregate type.
    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    /// Invalid event data or stream state.
    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// Event publication failed (after a successful append).
    #[error("event publication failed: {0}")]
    Publish(String),
}

/// Per-aggregate optimistic concurrency precondition for an append.
///
/// Equivalent to a compare-and-swap on the stream's current max sequence:
/// `Exact(0)` claims the stream is empty.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SequenceGuard {
    pub aggregate_id: AggregateId,
    pub expected: ExpectedSequence,
}

impl SequenceGuard {
    pub fn exact(aggregate_id: AggregateId, sequence: u64) -> Self {
        Self {
            aggregate_id,
            expected: ExpectedSequence::Exact(sequence),
        }
    }
}

/// Append-only, instance-scoped event store.
///
/// ## Streams
///
/// Events are organized into streams, one per aggregate instance, keyed
/// `(instance_id, aggregate_id)`. Within a stream, sequences are contiguous
/// starting at 1. Across streams of one instance, `position` gives the total
/// order projections rely on.
///
/// ## Append semantics
///
/// One append call may carry events for several aggregates **of the same
/// instance** and is atomic: all events are persisted or none are. Guards are
/// checked against each aggregate's current max sequence before anything is
/// written; a mismatch is `Concurrency`.
///
/// ## Filter semantics
///
/// `filter` returns events in ascending `(position, sequence)` order,
/// paginated by limit + continuation position, so catch-up never loads an
/// unbounded result set at once.
///
/// ## Implementation requirements
///
/// - enforce instance isolation (reject cross-instance batches)
/// - assign contiguous per-stream sequences and monotonic positions
/// - keep the stream's aggregate type stable
/// - make append atomic and guard checks race-free
pub trait EventStore: Send + Sync {
    /// Append events atomically, honoring the per-aggregate guards.
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        guards: &[SequenceGuard],
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Filter events by predicate, ascending `(position, sequence)`.
    fn filter(&self, query: &SearchQuery) -> Result<EventPage, EventStoreError>;

    /// Highest assigned position for an instance (`Position::ZERO` if none).
    fn latest_position(&self, instance_id: InstanceId) -> Result<Position, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        guards: &[SequenceGuard],
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, guards)
    }

    fn filter(&self, query: &SearchQuery) -> Result<EventPage, EventStoreError> {
        (**self).filter(query)
    }

    fn latest_position(&self, instance_id: InstanceId) -> Result<Position, EventStoreError> {
        (**self).latest_position(instance_id)
    }
}

impl UncommittedEvent {
    /// Convenience constructor from a typed domain event.
    ///
    /// Serializes the payload and captures the event metadata needed for
    /// future dispatch, keeping infra decoupled from the domain crates.
    pub fn from_typed<E>(
        instance_id: InstanceId,
        resource_owner: OrgId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        editor: UserId,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: keyforge_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            instance_id,
            resource_owner,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            editor,
            payload,
        })
    }
}
