//! Limits read model: one row per resource owner.
//!
//! `limits.set` upserts the full row; `limits.reset` deletes it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use keyforge_core::{AggregateId, OrgId};
use keyforge_events::EventEnvelope;
use keyforge_limits::{LimitsSet, event_types};

use super::ProjectionError;
use super::handler::ProjectionHandler;
use super::statement::{NoChanges, RowOp};
use super::table::ProjectionTable;
use crate::event_store::EventStore;

/// Handler name (watermark key).
pub const LIMITS_PROJECTION: &str = "projections.limits";

/// Queryable limits row, keyed `(instance_id, resource_owner)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitsRow {
    pub resource_owner: OrgId,
    pub aggregate_id: AggregateId,
    pub audit_log_retention: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub changed_at: DateTime<Utc>,
    pub sequence: u64,
}

type LimitsOp = RowOp<OrgId, LimitsRow, NoChanges>;

/// Build the limits projection handler.
pub fn limits_projection<S, T>(
    store: S,
    table: T,
) -> ProjectionHandler<OrgId, LimitsRow, NoChanges, S, T>
where
    S: EventStore,
    T: ProjectionTable<OrgId, LimitsRow, NoChanges>,
{
    ProjectionHandler::new(
        LIMITS_PROJECTION,
        vec![keyforge_limits::AGGREGATE_TYPE],
        store,
        table,
    )
    .on(event_types::SET, reduce_set)
    .on(event_types::RESET, reduce_reset)
}

fn reduce_set(envelope: &EventEnvelope<JsonValue>) -> Result<Option<LimitsOp>, ProjectionError> {
    let e: LimitsSet = serde_json::from_value(envelope.payload().clone()).map_err(|err| {
        ProjectionError::Fold(format!(
            "undecodable '{}' payload at position {}: {err}",
            envelope.event_type(),
            envelope.position()
        ))
    })?;

    Ok(Some(RowOp::Upsert {
        key: envelope.resource_owner(),
        row: LimitsRow {
            resource_owner: envelope.resource_owner(),
            aggregate_id: envelope.aggregate_id(),
            audit_log_retention: e.audit_log_retention,
            created_at: envelope.created_at(),
            changed_at: envelope.created_at(),
            sequence: envelope.sequence(),
        },
    }))
}

fn reduce_reset(envelope: &EventEnvelope<JsonValue>) -> Result<Option<LimitsOp>, ProjectionError> {
    Ok(Some(RowOp::Delete {
        key: envelope.resource_owner(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keyforge_core::{InstanceId, Position, UserId};
    use serde_json::json;
    use uuid::Uuid;

    fn envelope(event_type: &str, payload: JsonValue) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            InstanceId::new(),
            OrgId::new(),
            AggregateId::new(),
            keyforge_limits::AGGREGATE_TYPE,
            15,
            Position::new(15),
            event_type,
            UserId::new(),
            Utc::now(),
            payload,
        )
    }

    #[test]
    fn set_event_folds_to_an_upsert_with_the_retention() {
        let envelope = envelope(event_types::SET, json!({"auditLogRetention": 300000000000u64}));

        let op = reduce_set(&envelope).unwrap().unwrap();
        match op {
            RowOp::Upsert { key, row } => {
                assert_eq!(key, envelope.resource_owner());
                assert_eq!(row.audit_log_retention, Some(Duration::from_secs(300)));
                assert_eq!(row.sequence, 15);
                assert_eq!(row.aggregate_id, envelope.aggregate_id());
            }
            other => panic!("expected upsert, got {other:?}"),
        }
    }

    #[test]
    fn reset_event_folds_to_a_delete() {
        let envelope = envelope(event_types::RESET, json!({}));

        let op = reduce_reset(&envelope).unwrap().unwrap();
        assert!(matches!(op, RowOp::Delete { key } if key == envelope.resource_owner()));
    }

    #[test]
    fn malformed_set_payload_is_a_fold_error() {
        let envelope = envelope(event_types::SET, json!({"auditLogRetention": "5m"}));
        let err = reduce_set(&envelope).unwrap_err();
        assert!(matches!(err, ProjectionError::Fold(_)));
    }
}
