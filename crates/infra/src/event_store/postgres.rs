//! Postgres-backed event store implementation.
//!
//! Persists events append-only with instance isolation, optimistic
//! concurrency and a global position, all enforced at the database level.
//!
//! ## Schema expectations
//!
//! The `events` table carries one row per event with a unique constraint on
//! `(instance_id, aggregate_id, sequence)` and a `position` column fed by a
//! global sequence (`events_position_seq`). The unique constraint is the
//! second line of defense for concurrency: if two transactions pass the
//! version check simultaneously, one insert violates it and maps to
//! `Concurrency`.
//!
//! ## Error mapping
//!
//! | PostgreSQL error code | EventStoreError | Scenario |
//! |-----------------------|-----------------|----------|
//! | `23505` (unique)      | `Concurrency`   | concurrent append on the same stream |
//! | `23503` (foreign key) | `InvalidAppend` | referential violation (not expected here) |
//! | `23514` (check)       | `InvalidAppend` | invalid data (e.g. sequence <= 0) |
//! | other                 | `InvalidAppend` | pool closed, network, etc. |
//!
//! ## Thread safety
//!
//! `PostgresEventStore` is `Send + Sync`; all operations go through the SQLx
//! connection pool.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::{Span, instrument};
use uuid::Uuid;

use keyforge_core::{AggregateId, InstanceId, OrgId, Position, UserId};

use super::record::{EventStore, EventStoreError, SequenceGuard, StoredEvent, UncommittedEvent};
use super::search::{EventPage, EventQuery, SearchQuery};

/// Postgres-backed append-only event store.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    /// Create a new store with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Append events atomically with per-aggregate optimistic concurrency.
    ///
    /// One transaction: read the current sequence per touched stream, check
    /// every guard, insert all events, commit. Any failure rolls the whole
    /// batch back.
    #[instrument(
        skip(self, events, guards),
        fields(
            instance_id = %instance_id.as_uuid(),
            event_count = events.len(),
            guard_count = guards.len()
        ),
        err
    )]
    pub async fn append_events(
        &self,
        instance_id: InstanceId,
        events: Vec<UncommittedEvent>,
        guards: &[SequenceGuard],
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        for (idx, e) in events.iter().enumerate() {
            if e.instance_id != instance_id {
                return Err(EventStoreError::InstanceIsolation(format!(
                    "batch contains multiple instance_ids (index {idx})"
                )));
            }
        }

        let span = Span::current();
        span.record("operation", "append_events");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Current sequence + pinned aggregate type per stream touched by the
        // batch or named by a guard.
        let mut sequences: HashMap<AggregateId, u64> = HashMap::new();
        let mut stream_types: HashMap<AggregateId, Option<String>> = HashMap::new();
        for aggregate_id in events
            .iter()
            .map(|e| e.aggregate_id)
            .chain(guards.iter().map(|g| g.aggregate_id))
        {
            if sequences.contains_key(&aggregate_id) {
                continue;
            }
            let (current, aggregate_type) =
                check_stream_version(&mut tx, instance_id, aggregate_id).await?;
            sequences.insert(aggregate_id, current);
            stream_types.insert(aggregate_id, aggregate_type);
        }

        for guard in guards {
            let current = sequences.get(&guard.aggregate_id).copied().unwrap_or(0);
            if !guard.expected.matches(current) {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(EventStoreError::Concurrency(format!(
                    "aggregate {}: expected {:?}, found {current}",
                    guard.aggregate_id, guard.expected
                )));
            }
        }

        let mut committed = Vec::with_capacity(events.len());
        for event in events {
            match stream_types.get(&event.aggregate_id) {
                Some(Some(existing)) if *existing != event.aggregate_type => {
                    tx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("rollback", e))?;
                    return Err(EventStoreError::AggregateTypeMismatch(format!(
                        "stream aggregate_type is '{existing}', attempted append with '{}'",
                        event.aggregate_type
                    )));
                }
                _ => {
                    stream_types
                        .insert(event.aggregate_id, Some(event.aggregate_type.clone()));
                }
            }

            let sequence = sequences.get(&event.aggregate_id).copied().unwrap_or(0) + 1;
            sequences.insert(event.aggregate_id, sequence);

            let row = sqlx::query(
                r#"
                INSERT INTO events (
                    event_id,
                    instance_id,
                    resource_owner,
                    aggregate_id,
                    aggregate_type,
                    sequence,
                    position,
                    event_type,
                    event_version,
                    editor,
                    payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, nextval('events_position_seq'), $7, $8, $9, $10)
                RETURNING position, created_at
                "#,
            )
            .bind(event.event_id)
            .bind(instance_id.as_uuid())
            .bind(event.resource_owner.as_uuid())
            .bind(event.aggregate_id.as_uuid())
            .bind(&event.aggregate_type)
            .bind(sequence as i64)
            .bind(&event.event_type)
            .bind(event.event_version as i32)
            .bind(event.editor.as_uuid())
            .bind(&event.payload)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                // A unique violation here means a concurrent transaction won
                // the race between our version check and our insert.
                if is_unique_violation(&e) {
                    EventStoreError::Concurrency(format!(
                        "concurrent append detected: sequence {sequence} already exists"
                    ))
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;

            let position: i64 = row
                .try_get("position")
                .map_err(|e| EventStoreError::InvalidAppend(format!("failed to read position: {e}")))?;
            let created_at: DateTime<Utc> = row
                .try_get("created_at")
                .map_err(|e| EventStoreError::InvalidAppend(format!("failed to read created_at: {e}")))?;

            committed.push(StoredEvent {
                event_id: event.event_id,
                instance_id: event.instance_id,
                resource_owner: event.resource_owner,
                aggregate_id: event.aggregate_id,
                aggregate_type: event.aggregate_type,
                sequence,
                position: Position::new(position as u64),
                event_type: event.event_type,
                event_version: event.event_version,
                editor: event.editor,
                created_at,
                payload: event.payload,
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        span.record("committed_events", committed.len());
        Ok(committed)
    }

    /// Filter events in ascending `(position, sequence)` order.
    ///
    /// Fetches one row past the limit to decide whether a continuation
    /// position must be returned.
    #[instrument(
        skip(self, query),
        fields(instance_id = %query.instance_id().as_uuid(), limit = query.limit()),
        err
    )]
    pub async fn filter_events(&self, query: &SearchQuery) -> Result<EventPage, EventStoreError> {
        let span = Span::current();
        span.record("operation", "filter_events");

        let aggregate_id: Option<Uuid> = query.aggregate_id().map(|id| *id.as_uuid());
        let resource_owner: Option<Uuid> = query.resource_owner().map(|o| *o.as_uuid());
        let aggregate_types: Vec<String> = query.aggregate_types().to_vec();
        let event_types: Vec<String> = query.event_types().to_vec();
        let sequence_from: Option<i64> = query.sequence_from().map(|s| s as i64);
        let sequence_to: Option<i64> = query.sequence_to().map(|s| s as i64);
        let position_after: Option<i64> = query.position_after().map(|p| p.as_u64() as i64);
        let limit = query.limit() as i64;

        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                instance_id,
                resource_owner,
                aggregate_id,
                aggregate_type,
                sequence,
                position,
                event_type,
                event_version,
                editor,
                payload,
                created_at
            FROM events
            WHERE instance_id = $1
                AND (cardinality($2::text[]) = 0 OR aggregate_type = ANY($2))
                AND ($3::uuid IS NULL OR aggregate_id = $3)
                AND (cardinality($4::text[]) = 0 OR event_type = ANY($4))
                AND ($5::uuid IS NULL OR resource_owner = $5)
                AND ($6::bigint IS NULL OR sequence >= $6)
                AND ($7::bigint IS NULL OR sequence <= $7)
                AND ($8::bigint IS NULL OR position > $8)
            ORDER BY position ASC, sequence ASC
            LIMIT $9
            "#,
        )
        .bind(query.instance_id().as_uuid())
        .bind(&aggregate_types)
        .bind(aggregate_id)
        .bind(&event_types)
        .bind(resource_owner)
        .bind(sequence_from)
        .bind(sequence_to)
        .bind(position_after)
        .bind(limit + 1)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("filter_events", e))?;

        let more = rows.len() > limit as usize;
        let mut events: Vec<StoredEvent> = Vec::with_capacity(rows.len().min(limit as usize));
        for row in rows.into_iter().take(limit as usize) {
            let stored = StoredEventRow::from_row(&row).map_err(|e| {
                EventStoreError::InvalidAppend(format!("failed to deserialize event row: {e}"))
            })?;
            events.push(stored.into());
        }

        span.record("event_count", events.len());

        let continuation = match (more, events.last()) {
            (true, Some(last)) => Some(last.position),
            _ => None,
        };

        Ok(EventPage {
            events,
            continuation,
        })
    }

    /// Highest assigned position for an instance.
    #[instrument(skip(self), fields(instance_id = %instance_id.as_uuid()), err)]
    pub async fn latest_position_for(
        &self,
        instance_id: InstanceId,
    ) -> Result<Position, EventStoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(position), 0) AS position FROM events WHERE instance_id = $1",
        )
        .bind(instance_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_position", e))?;

        let position: i64 = row
            .try_get("position")
            .map_err(|e| EventStoreError::InvalidAppend(format!("failed to read position: {e}")))?;

        Ok(Position::new(position as u64))
    }
}

/// Read `(current max sequence, pinned aggregate type)` for one stream.
async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: InstanceId,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(sequence), 0) AS current_sequence,
            MAX(aggregate_type) AS aggregate_type
        FROM events
        WHERE instance_id = $1 AND aggregate_id = $2
        "#,
    )
    .bind(instance_id.as_uuid())
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current: Option<i64> = row
        .try_get("current_sequence")
        .map_err(|e| EventStoreError::InvalidAppend(format!("failed to read current_sequence: {e}")))?;
    let aggregate_type: Option<String> = row
        .try_get("aggregate_type")
        .map_err(|e| EventStoreError::InvalidAppend(format!("failed to read aggregate_type: {e}")))?;

    Ok((current.unwrap_or(0) as u64, aggregate_type))
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                Some("23503") | Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::InvalidAppend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::InvalidAppend(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            EventStoreError::InvalidAppend(format!("unexpected row not found in {operation}"))
        }
        _ => EventStoreError::InvalidAppend(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct StoredEventRow {
    event_id: Uuid,
    instance_id: Uuid,
    resource_owner: Uuid,
    aggregate_id: Uuid,
    aggregate_type: String,
    sequence: i64,
    position: i64,
    event_type: String,
    event_version: i32,
    editor: Uuid,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            instance_id: row.try_get("instance_id")?,
            resource_owner: row.try_get("resource_owner")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence: row.try_get("sequence")?,
            position: row.try_get("position")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            editor: row.try_get("editor")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            event_id: row.event_id,
            instance_id: InstanceId::from_uuid(row.instance_id),
            resource_owner: OrgId::from_uuid(row.resource_owner),
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence: row.sequence as u64,
            position: Position::new(row.position as u64),
            event_type: row.event_type,
            event_version: row.event_version as u32,
            editor: UserId::from_uuid(row.editor),
            created_at: row.created_at,
            payload: row.payload,
        }
    }
}

// Implement the synchronous EventStore trait by bridging into the runtime.

fn runtime_handle() -> Result<tokio::runtime::Handle, EventStoreError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        EventStoreError::InvalidAppend(
            "PostgresEventStore requires an async runtime (tokio). Ensure you're calling from within a tokio runtime context.".to_string(),
        )
    })
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        guards: &[SequenceGuard],
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        let instance_id = events[0].instance_id;
        runtime_handle()?.block_on(self.append_events(instance_id, events, guards))
    }

    fn filter(&self, query: &SearchQuery) -> Result<EventPage, EventStoreError> {
        runtime_handle()?.block_on(self.filter_events(query))
    }

    fn latest_position(&self, instance_id: InstanceId) -> Result<Position, EventStoreError> {
        runtime_handle()?.block_on(self.latest_position_for(instance_id))
    }
}

#[async_trait::async_trait]
impl EventQuery for PostgresEventStore {
    async fn query_events(&self, query: &SearchQuery) -> Result<EventPage, EventStoreError> {
        self.filter_events(query).await
    }

    async fn get_event_by_id(
        &self,
        instance_id: InstanceId,
        event_id: Uuid,
    ) -> Result<Option<StoredEvent>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                event_id,
                instance_id,
                resource_owner,
                aggregate_id,
                aggregate_type,
                sequence,
                position,
                event_type,
                event_version,
                editor,
                payload,
                created_at
            FROM events
            WHERE instance_id = $1 AND event_id = $2
            LIMIT 1
            "#,
        )
        .bind(instance_id.as_uuid())
        .bind(event_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_event_by_id", e))?;

        match row {
            Some(row) => {
                let stored = StoredEventRow::from_row(&row).map_err(|e| {
                    EventStoreError::InvalidAppend(format!("failed to deserialize event row: {e}"))
                })?;
                Ok(Some(stored.into()))
            }
            None => Ok(None),
        }
    }
}
