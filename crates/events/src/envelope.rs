use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keyforge_core::{AggregateId, InstanceId, OrgId, Position, UserId};

/// Envelope for a committed event, carrying instance + stream metadata.
///
/// This is the unit write models fold and projections consume.
///
/// Notes:
/// - **Instance isolation** is enforced here via `instance_id`.
/// - `sequence` is monotonically increasing per aggregate stream, no gaps.
/// - `position` is the global order token across aggregates of the instance.
/// - `payload` is the domain-agnostic event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    instance_id: InstanceId,
    resource_owner: OrgId,

    aggregate_id: AggregateId,
    aggregate_type: String,

    sequence: u64,
    position: Position,

    event_type: String,
    editor: UserId,
    created_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: Uuid,
        instance_id: InstanceId,
        resource_owner: OrgId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence: u64,
        position: Position,
        event_type: impl Into<String>,
        editor: UserId,
        created_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            instance_id,
            resource_owner,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence,
            position,
            event_type: event_type.into(),
            editor,
            created_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn resource_owner(&self) -> OrgId {
        self.resource_owner
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn editor(&self) -> UserId {
        self.editor
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
