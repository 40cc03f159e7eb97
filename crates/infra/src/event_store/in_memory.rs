use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;

use keyforge_core::{InstanceId, Position};

use super::record::{EventStore, EventStoreError, SequenceGuard, StoredEvent, UncommittedEvent};
use super::search::{EventPage, SearchQuery};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    instance_id: InstanceId,
    aggregate_id: keyforge_core::AggregateId,
}

#[derive(Debug, Default)]
struct Inner {
    /// Append order == position order (positions are per-instance monotonic).
    log: Vec<StoredEvent>,
    /// Current max sequence per stream.
    sequences: HashMap<StreamKey, u64>,
    /// Aggregate type pinned by the stream's first event.
    stream_types: HashMap<StreamKey, String>,
    /// Current max position per instance.
    positions: HashMap<InstanceId, u64>,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Append atomicity comes from the single write lock;
/// the guard check and the sequence assignment happen under it, so the
/// compare-and-swap semantics match the Postgres backend.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        guards: &[SequenceGuard],
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        // All events in a batch must target the same instance.
        let instance_id = events[0].instance_id;
        for (idx, e) in events.iter().enumerate() {
            if e.instance_id != instance_id {
                return Err(EventStoreError::InstanceIsolation(format!(
                    "batch contains multiple instance_ids (index {idx})"
                )));
            }
        }

        let mut inner = self
            .inner
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        // Check all guards before writing anything (all-or-nothing).
        for guard in guards {
            let key = StreamKey {
                instance_id,
                aggregate_id: guard.aggregate_id,
            };
            let current = inner.sequences.get(&key).copied().unwrap_or(0);
            if !guard.expected.matches(current) {
                return Err(EventStoreError::Concurrency(format!(
                    "aggregate {}: expected {:?}, found {current}",
                    guard.aggregate_id, guard.expected
                )));
            }
        }

        // Enforce aggregate type stability per stream, including within the batch.
        for e in &events {
            let key = StreamKey {
                instance_id,
                aggregate_id: e.aggregate_id,
            };
            match inner.stream_types.get(&key) {
                Some(existing) if *existing != e.aggregate_type => {
                    return Err(EventStoreError::AggregateTypeMismatch(format!(
                        "stream aggregate_type is '{existing}', attempted append with '{}'",
                        e.aggregate_type
                    )));
                }
                Some(_) => {}
                None => {
                    inner
                        .stream_types
                        .insert(key, e.aggregate_type.clone());
                }
            }
        }

        // Assign sequences per stream and positions per instance, in input order.
        let created_at = Utc::now();
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let key = StreamKey {
                instance_id,
                aggregate_id: e.aggregate_id,
            };
            let sequence = inner.sequences.get(&key).copied().unwrap_or(0) + 1;
            inner.sequences.insert(key, sequence);

            let position = inner.positions.get(&instance_id).copied().unwrap_or(0) + 1;
            inner.positions.insert(instance_id, position);

            let stored = StoredEvent {
                event_id: e.event_id,
                instance_id: e.instance_id,
                resource_owner: e.resource_owner,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence,
                position: Position::new(position),
                event_type: e.event_type,
                event_version: e.event_version,
                editor: e.editor,
                created_at,
                payload: e.payload,
            };
            inner.log.push(stored.clone());
            committed.push(stored);
        }

        Ok(committed)
    }

    fn filter(&self, query: &SearchQuery) -> Result<EventPage, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        // The log is in global append order; an instance's subsequence is
        // therefore already ascending by (position, sequence).
        let limit = query.limit() as usize;
        let mut events = Vec::new();
        let mut more = false;
        for event in inner.log.iter().filter(|e| query.matches(e)) {
            if events.len() == limit {
                more = true;
                break;
            }
            events.push(event.clone());
        }

        let continuation = match (more, events.last()) {
            (true, Some(last)) => Some(last.position),
            _ => None,
        };

        Ok(EventPage {
            events,
            continuation,
        })
    }

    fn latest_position(&self, instance_id: InstanceId) -> Result<Position, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        Ok(inner
            .positions
            .get(&instance_id)
            .copied()
            .map(Position::new)
            .unwrap_or(Position::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyforge_core::{AggregateId, ExpectedSequence, OrgId, UserId};
    use serde_json::json;
    use uuid::Uuid;

    fn draft(
        instance_id: InstanceId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        event_type: &str,
    ) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            instance_id,
            resource_owner: OrgId::new(),
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: event_type.to_string(),
            event_version: 1,
            editor: UserId::new(),
            payload: json!({}),
        }
    }

    #[test]
    fn append_assigns_contiguous_sequences_and_positions() {
        let store = InMemoryEventStore::new();
        let instance_id = InstanceId::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        let committed = store
            .append(
                vec![
                    draft(instance_id, a, "user", "user.created"),
                    draft(instance_id, a, "user", "user.email.updated"),
                    draft(instance_id, b, "limits", "limits.set"),
                ],
                &[],
            )
            .unwrap();

        assert_eq!(committed[0].sequence, 1);
        assert_eq!(committed[1].sequence, 2);
        assert_eq!(committed[2].sequence, 1);
        assert_eq!(committed[0].position, Position::new(1));
        assert_eq!(committed[1].position, Position::new(2));
        assert_eq!(committed[2].position, Position::new(3));
        assert_eq!(store.latest_position(instance_id).unwrap(), Position::new(3));
    }

    #[test]
    fn guard_mismatch_fails_without_persisting_anything() {
        let store = InMemoryEventStore::new();
        let instance_id = InstanceId::new();
        let aggregate_id = AggregateId::new();

        store
            .append(
                vec![draft(instance_id, aggregate_id, "user", "user.created")],
                &[SequenceGuard::exact(aggregate_id, 0)],
            )
            .unwrap();

        let err = store
            .append(
                vec![draft(instance_id, aggregate_id, "user", "user.updated")],
                &[SequenceGuard::exact(aggregate_id, 0)],
            )
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));

        // Nothing was written by the failed append.
        let page = store
            .filter(&SearchQuery::for_instance(instance_id))
            .unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(store.latest_position(instance_id).unwrap(), Position::new(1));
    }

    #[test]
    fn stale_guard_retry_succeeds_at_a_greater_sequence() {
        let store = InMemoryEventStore::new();
        let instance_id = InstanceId::new();
        let aggregate_id = AggregateId::new();

        store
            .append(
                vec![draft(instance_id, aggregate_id, "user", "user.created")],
                &[SequenceGuard::exact(aggregate_id, 0)],
            )
            .unwrap();

        let first = store
            .append(
                vec![draft(instance_id, aggregate_id, "user", "user.updated")],
                &[SequenceGuard::exact(aggregate_id, 1)],
            )
            .unwrap();
        assert_eq!(first[0].sequence, 2);

        // A competing writer with the same stale expectation loses.
        let err = store
            .append(
                vec![draft(instance_id, aggregate_id, "user", "user.updated")],
                &[SequenceGuard::exact(aggregate_id, 1)],
            )
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));

        // Reload (now at 2) and retry.
        let second = store
            .append(
                vec![draft(instance_id, aggregate_id, "user", "user.updated")],
                &[SequenceGuard::exact(aggregate_id, 2)],
            )
            .unwrap();
        assert_eq!(second[0].sequence, 3);
    }

    #[test]
    fn append_rejects_cross_instance_batches() {
        let store = InMemoryEventStore::new();
        let err = store
            .append(
                vec![
                    draft(InstanceId::new(), AggregateId::new(), "user", "user.created"),
                    draft(InstanceId::new(), AggregateId::new(), "user", "user.created"),
                ],
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InstanceIsolation(_)));
    }

    #[test]
    fn append_rejects_aggregate_type_changes() {
        let store = InMemoryEventStore::new();
        let instance_id = InstanceId::new();
        let aggregate_id = AggregateId::new();

        store
            .append(
                vec![draft(instance_id, aggregate_id, "user", "user.created")],
                &[],
            )
            .unwrap();

        let err = store
            .append(
                vec![draft(instance_id, aggregate_id, "limits", "limits.set")],
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }

    #[test]
    fn filter_honors_predicates_and_instance_isolation() {
        let store = InMemoryEventStore::new();
        let instance_id = InstanceId::new();
        let other_instance = InstanceId::new();
        let user = AggregateId::new();
        let limits = AggregateId::new();

        store
            .append(
                vec![
                    draft(instance_id, user, "user", "user.created"),
                    draft(instance_id, user, "user", "user.email.updated"),
                    draft(instance_id, limits, "limits", "limits.set"),
                ],
                &[],
            )
            .unwrap();
        store
            .append(
                vec![draft(other_instance, AggregateId::new(), "user", "user.created")],
                &[],
            )
            .unwrap();

        let page = store
            .filter(&SearchQuery::for_instance(instance_id).with_aggregate_type("user"))
            .unwrap();
        assert_eq!(page.events.len(), 2);
        assert!(page.events.iter().all(|e| e.aggregate_type == "user"));

        let page = store
            .filter(
                &SearchQuery::for_instance(instance_id).with_event_type("user.email.updated"),
            )
            .unwrap();
        assert_eq!(page.events.len(), 1);

        let page = store
            .filter(&SearchQuery::for_instance(instance_id).with_aggregate_id(limits))
            .unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].aggregate_type, "limits");
    }

    #[test]
    fn filter_paginates_with_continuation_positions() {
        let store = InMemoryEventStore::new();
        let instance_id = InstanceId::new();
        let aggregate_id = AggregateId::new();

        let drafts: Vec<_> = (0..5)
            .map(|_| draft(instance_id, aggregate_id, "user", "user.updated"))
            .collect();
        store.append(drafts, &[]).unwrap();

        let mut seen = Vec::new();
        let mut cursor = Position::ZERO;
        loop {
            let page = store
                .filter(
                    &SearchQuery::for_instance(instance_id)
                        .with_position_after(cursor)
                        .with_limit(2),
                )
                .unwrap();
            seen.extend(page.events.iter().map(|e| e.sequence));
            match page.continuation {
                Some(position) => cursor = position,
                None => break,
            }
        }

        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn filter_honors_sequence_ranges() {
        let store = InMemoryEventStore::new();
        let instance_id = InstanceId::new();
        let aggregate_id = AggregateId::new();

        let drafts: Vec<_> = (0..4)
            .map(|_| draft(instance_id, aggregate_id, "user", "user.updated"))
            .collect();
        store.append(drafts, &[]).unwrap();

        let page = store
            .filter(
                &SearchQuery::for_instance(instance_id)
                    .with_aggregate_id(aggregate_id)
                    .with_sequence_between(2, 3),
            )
            .unwrap();

        let sequences: Vec<_> = page.events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
    }

    #[test]
    fn guards_allow_any_expectation() {
        let store = InMemoryEventStore::new();
        let instance_id = InstanceId::new();
        let aggregate_id = AggregateId::new();

        store
            .append(
                vec![draft(instance_id, aggregate_id, "user", "user.created")],
                &[SequenceGuard {
                    aggregate_id,
                    expected: ExpectedSequence::Any,
                }],
            )
            .unwrap();
        store
            .append(
                vec![draft(instance_id, aggregate_id, "user", "user.updated")],
                &[SequenceGuard {
                    aggregate_id,
                    expected: ExpectedSequence::Any,
                }],
            )
            .unwrap();
    }
}
