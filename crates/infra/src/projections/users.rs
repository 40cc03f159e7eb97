//! Users read model: one row per schema user.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use keyforge_core::{AggregateId, OrgId};
use keyforge_events::EventEnvelope;
use keyforge_users::event_types;
use keyforge_users::{EmailUpdated, PhoneUpdated, UserCreated, UserUpdated};

use super::ProjectionError;
use super::handler::ProjectionHandler;
use super::statement::{RowChange, RowOp};
use super::table::ProjectionTable;
use crate::event_store::EventStore;

/// Handler name (watermark key).
pub const USERS_PROJECTION: &str = "projections.users";

/// Queryable user row, keyed `(instance_id, user_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub user_id: AggregateId,
    pub resource_owner: OrgId,
    pub schema_id: AggregateId,
    pub schema_revision: u32,
    pub data: JsonValue,
    pub email: Option<String>,
    pub email_verified: bool,
    pub phone: Option<String>,
    pub phone_verified: bool,
    pub created_at: DateTime<Utc>,
    pub changed_at: DateTime<Utc>,
    pub sequence: u64,
}

/// Column-level change for a user row.
#[derive(Debug, Clone)]
pub struct UserRowChange {
    pub sequence: u64,
    pub changed_at: DateTime<Utc>,
    pub kind: UserRowChangeKind,
}

#[derive(Debug, Clone)]
pub enum UserRowChangeKind {
    General {
        schema_id: Option<AggregateId>,
        schema_revision: Option<u32>,
        data: Option<JsonValue>,
    },
    EmailUpdated { address: String },
    EmailVerified,
    PhoneUpdated { number: String },
    PhoneVerified,
}

impl RowChange<UserRow> for UserRowChange {
    fn apply_to(&self, row: &mut UserRow) {
        match &self.kind {
            UserRowChangeKind::General {
                schema_id,
                schema_revision,
                data,
            } => {
                if let Some(schema_id) = schema_id {
                    row.schema_id = *schema_id;
                }
                if let Some(revision) = schema_revision {
                    row.schema_revision = *revision;
                }
                if let Some(data) = data {
                    row.data = data.clone();
                }
            }
            UserRowChangeKind::EmailUpdated { address } => {
                row.email = Some(address.clone());
                row.email_verified = false;
            }
            UserRowChangeKind::EmailVerified => row.email_verified = true,
            UserRowChangeKind::PhoneUpdated { number } => {
                row.phone = Some(number.clone());
                row.phone_verified = false;
            }
            UserRowChangeKind::PhoneVerified => row.phone_verified = true,
        }
        row.sequence = self.sequence;
        row.changed_at = self.changed_at;
    }
}

type UserOp = RowOp<AggregateId, UserRow, UserRowChange>;

/// Build the users projection handler.
///
/// Verification-code events are deliberately unregistered: codes never reach
/// the read model, and unmapped event types are skipped by contract.
pub fn users_projection<S, T>(
    store: S,
    table: T,
) -> ProjectionHandler<AggregateId, UserRow, UserRowChange, S, T>
where
    S: EventStore,
    T: ProjectionTable<AggregateId, UserRow, UserRowChange>,
{
    ProjectionHandler::new(
        USERS_PROJECTION,
        vec![keyforge_users::AGGREGATE_TYPE],
        store,
        table,
    )
    .on(event_types::CREATED, reduce_created)
    .on(event_types::UPDATED, reduce_updated)
    .on(event_types::DELETED, reduce_deleted)
    .on(event_types::EMAIL_UPDATED, reduce_email_updated)
    .on(event_types::EMAIL_VERIFIED, reduce_email_verified)
    .on(event_types::PHONE_UPDATED, reduce_phone_updated)
    .on(event_types::PHONE_VERIFIED, reduce_phone_verified)
}

fn reduce_created(envelope: &EventEnvelope<JsonValue>) -> Result<Option<UserOp>, ProjectionError> {
    let e: UserCreated = decode(envelope)?;
    Ok(Some(RowOp::Upsert {
        key: envelope.aggregate_id(),
        row: UserRow {
            user_id: envelope.aggregate_id(),
            resource_owner: envelope.resource_owner(),
            schema_id: e.schema_id,
            schema_revision: e.schema_revision,
            data: e.data,
            email: None,
            email_verified: false,
            phone: None,
            phone_verified: false,
            created_at: envelope.created_at(),
            changed_at: envelope.created_at(),
            sequence: envelope.sequence(),
        },
    }))
}

fn reduce_updated(envelope: &EventEnvelope<JsonValue>) -> Result<Option<UserOp>, ProjectionError> {
    let e: UserUpdated = decode(envelope)?;
    Ok(Some(RowOp::Change {
        key: envelope.aggregate_id(),
        change: UserRowChange {
            sequence: envelope.sequence(),
            changed_at: envelope.created_at(),
            kind: UserRowChangeKind::General {
                schema_id: e.schema_id,
                schema_revision: e.schema_revision,
                data: e.data,
            },
        },
    }))
}

fn reduce_deleted(envelope: &EventEnvelope<JsonValue>) -> Result<Option<UserOp>, ProjectionError> {
    Ok(Some(RowOp::Delete {
        key: envelope.aggregate_id(),
    }))
}

fn reduce_email_updated(
    envelope: &EventEnvelope<JsonValue>,
) -> Result<Option<UserOp>, ProjectionError> {
    let e: EmailUpdated = decode(envelope)?;
    Ok(Some(RowOp::Change {
        key: envelope.aggregate_id(),
        change: UserRowChange {
            sequence: envelope.sequence(),
            changed_at: envelope.created_at(),
            kind: UserRowChangeKind::EmailUpdated { address: e.address },
        },
    }))
}

fn reduce_email_verified(
    envelope: &EventEnvelope<JsonValue>,
) -> Result<Option<UserOp>, ProjectionError> {
    Ok(Some(RowOp::Change {
        key: envelope.aggregate_id(),
        change: UserRowChange {
            sequence: envelope.sequence(),
            changed_at: envelope.created_at(),
            kind: UserRowChangeKind::EmailVerified,
        },
    }))
}

fn reduce_phone_updated(
    envelope: &EventEnvelope<JsonValue>,
) -> Result<Option<UserOp>, ProjectionError> {
    let e: PhoneUpdated = decode(envelope)?;
    Ok(Some(RowOp::Change {
        key: envelope.aggregate_id(),
        change: UserRowChange {
            sequence: envelope.sequence(),
            changed_at: envelope.created_at(),
            kind: UserRowChangeKind::PhoneUpdated { number: e.number },
        },
    }))
}

fn reduce_phone_verified(
    envelope: &EventEnvelope<JsonValue>,
) -> Result<Option<UserOp>, ProjectionError> {
    Ok(Some(RowOp::Change {
        key: envelope.aggregate_id(),
        change: UserRowChange {
            sequence: envelope.sequence(),
            changed_at: envelope.created_at(),
            kind: UserRowChangeKind::PhoneVerified,
        },
    }))
}

fn decode<T: serde::de::DeserializeOwned>(
    envelope: &EventEnvelope<JsonValue>,
) -> Result<T, ProjectionError> {
    serde_json::from_value(envelope.payload().clone()).map_err(|e| {
        ProjectionError::Fold(format!(
            "undecodable '{}' payload at position {}: {e}",
            envelope.event_type(),
            envelope.position()
        ))
    })
}
