//! Declarative event predicates for write-model rebuilds and catch-up.
//!
//! A `SearchQuery` is deterministic: the same query against the same store
//! state yields the same events, in ascending `(position, sequence)` order.

use serde::{Deserialize, Serialize};

use keyforge_core::{AggregateId, InstanceId, OrgId, Position};

use super::record::StoredEvent;

/// Default page size for filter calls that do not set a limit.
pub const DEFAULT_LIMIT: u32 = 200;

/// Upper bound on a single page.
pub const MAX_LIMIT: u32 = 1000;

/// Filter predicate over the event log. Always instance-scoped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    instance_id: InstanceId,
    aggregate_types: Vec<String>,
    aggregate_id: Option<AggregateId>,
    event_types: Vec<String>,
    resource_owner: Option<OrgId>,
    sequence_from: Option<u64>,
    sequence_to: Option<u64>,
    position_after: Option<Position>,
    limit: u32,
}

impl SearchQuery {
    pub fn for_instance(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            aggregate_types: Vec::new(),
            aggregate_id: None,
            event_types: Vec::new(),
            resource_owner: None,
            sequence_from: None,
            sequence_to: None,
            position_after: None,
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn with_aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_types.push(aggregate_type.into());
        self
    }

    pub fn with_aggregate_types<I, T>(mut self, aggregate_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.aggregate_types
            .extend(aggregate_types.into_iter().map(Into::into));
        self
    }

    pub fn with_aggregate_id(mut self, aggregate_id: AggregateId) -> Self {
        self.aggregate_id = Some(aggregate_id);
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types.push(event_type.into());
        self
    }

    pub fn with_resource_owner(mut self, resource_owner: OrgId) -> Self {
        self.resource_owner = Some(resource_owner);
        self
    }

    /// Inclusive sequence range bounds.
    pub fn with_sequence_between(mut self, from: u64, to: u64) -> Self {
        self.sequence_from = Some(from);
        self.sequence_to = Some(to);
        self
    }

    /// Only events strictly after `position` (the catch-up cursor).
    pub fn with_position_after(mut self, position: Position) -> Self {
        self.position_after = Some(position);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit.clamp(1, MAX_LIMIT);
        self
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn aggregate_types(&self) -> &[String] {
        &self.aggregate_types
    }

    pub fn aggregate_id(&self) -> Option<AggregateId> {
        self.aggregate_id
    }

    pub fn event_types(&self) -> &[String] {
        &self.event_types
    }

    pub fn resource_owner(&self) -> Option<OrgId> {
        self.resource_owner
    }

    pub fn sequence_from(&self) -> Option<u64> {
        self.sequence_from
    }

    pub fn sequence_to(&self) -> Option<u64> {
        self.sequence_to
    }

    pub fn position_after(&self) -> Option<Position> {
        self.position_after
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Whether a stored event satisfies this predicate.
    pub fn matches(&self, event: &StoredEvent) -> bool {
        if event.instance_id != self.instance_id {
            return false;
        }
        if !self.aggregate_types.is_empty()
            && !self.aggregate_types.iter().any(|t| *t == event.aggregate_type)
        {
            return false;
        }
        if let Some(aggregate_id) = self.aggregate_id {
            if event.aggregate_id != aggregate_id {
                return false;
            }
        }
        if !self.event_types.is_empty()
            && !self.event_types.iter().any(|t| *t == event.event_type)
        {
            return false;
        }
        if let Some(resource_owner) = self.resource_owner {
            if event.resource_owner != resource_owner {
                return false;
            }
        }
        if let Some(from) = self.sequence_from {
            if event.sequence < from {
                return false;
            }
        }
        if let Some(to) = self.sequence_to {
            if event.sequence > to {
                return false;
            }
        }
        if let Some(after) = self.position_after {
            if event.position <= after {
                return false;
            }
        }
        true
    }
}

/// One page of filtered events.
///
/// `continuation` is the position of the last event in the page when more
/// matching events exist; feed it back via `with_position_after` to resume.
#[derive(Debug, Clone)]
pub struct EventPage {
    pub events: Vec<StoredEvent>,
    pub continuation: Option<Position>,
}

impl EventPage {
    pub fn empty() -> Self {
        Self {
            events: Vec::new(),
            continuation: None,
        }
    }
}

/// Async query interface for event inspection.
///
/// This is the read-side access point for downstream query services (audit
/// views, debugging tools). It mirrors `EventStore::filter` without forcing
/// consumers through the synchronous bridge.
#[async_trait::async_trait]
pub trait EventQuery: Send + Sync {
    /// Filter events by predicate, ascending `(position, sequence)`.
    async fn query_events(&self, query: &SearchQuery) -> Result<EventPage, super::EventStoreError>;

    /// Look up a single event by ID within an instance.
    async fn get_event_by_id(
        &self,
        instance_id: InstanceId,
        event_id: uuid::Uuid,
    ) -> Result<Option<StoredEvent>, super::EventStoreError>;
}
