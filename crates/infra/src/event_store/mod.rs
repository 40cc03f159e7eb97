//! Append-only event store boundary.
//!
//! Defines the storage-facing abstraction for appending and filtering
//! instance-scoped event streams, plus the in-memory and Postgres backends.

pub mod in_memory;
pub mod postgres;
pub mod record;
pub mod search;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use record::{EventStore, EventStoreError, SequenceGuard, StoredEvent, UncommittedEvent};
pub use search::{EventPage, EventQuery, SearchQuery};

/// Adapter that publishes committed events to an `EventBus` after a successful
/// append.
///
/// This ensures the ordering invariant: **publish happens only after append
/// succeeds**. Subscribers treat the publication as a wakeup and pull ordered
/// events from the store, so a lost or duplicated publication is harmless.
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: keyforge_events::EventBus<keyforge_events::EventEnvelope<serde_json::Value>>,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        guards: &[SequenceGuard],
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        // 1) Append (durable step)
        let committed = self.store.append(events, guards)?;

        // 2) Publish committed events (best-effort; at-least-once acceptable)
        for e in &committed {
            self.bus
                .publish(e.to_envelope())
                .map_err(|err| EventStoreError::Publish(format!("{err:?}")))?;
        }

        Ok(committed)
    }

    fn filter(&self, query: &SearchQuery) -> Result<EventPage, EventStoreError> {
        self.store.filter(query)
    }

    fn latest_position(
        &self,
        instance_id: keyforge_core::InstanceId,
    ) -> Result<keyforge_core::Position, EventStoreError> {
        self.store.latest_position(instance_id)
    }
}
