//! Postgres-backed projection tables.
//!
//! One concrete table per projection: a generic SQL mapping would need table
//! metadata plumbing, and the per-projection statement shapes are exactly
//! where the read models differ. Statement application and the watermark
//! advance share one transaction, which is what makes crash-retry safe.
//!
//! Watermarks live in `projection_watermarks (handler, instance_id, position)`
//! with the invariant that `position` never moves backwards.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::Span;

use keyforge_core::{AggregateId, InstanceId, OrgId, Position};

use super::ProjectionError;
use super::limits::LimitsRow;
use super::statement::{NoChanges, RowOp, Statement};
use super::table::ProjectionTable;
use super::users::{UserRow, UserRowChange, UserRowChangeKind};

fn runtime_handle() -> Option<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current().ok()
}

async fn read_watermark(
    pool: &PgPool,
    handler: &str,
    instance_id: InstanceId,
) -> Option<Position> {
    let row = sqlx::query(
        "SELECT position FROM projection_watermarks WHERE handler = $1 AND instance_id = $2",
    )
    .bind(handler)
    .bind(instance_id.as_uuid())
    .fetch_optional(pool)
    .await
    .ok()??;

    let position: i64 = row.try_get("position").ok()?;
    Some(Position::new(position as u64))
}

async fn advance_watermark(
    tx: &mut Transaction<'_, Postgres>,
    handler: &str,
    instance_id: InstanceId,
    watermark: Position,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO projection_watermarks (handler, instance_id, position)
        VALUES ($1, $2, $3)
        ON CONFLICT (handler, instance_id)
        DO UPDATE SET
            position = GREATEST(projection_watermarks.position, EXCLUDED.position),
            updated_at = NOW()
        "#,
    )
    .bind(handler)
    .bind(instance_id.as_uuid())
    .bind(watermark.as_u64() as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Postgres table for the users projection (`projections_users`).
pub struct PostgresUserTable {
    pool: Arc<PgPool>,
}

impl PostgresUserTable {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

impl ProjectionTable<AggregateId, UserRow, UserRowChange> for PostgresUserTable {
    fn get(&self, instance_id: InstanceId, key: &AggregateId) -> Option<UserRow> {
        let handle = runtime_handle()?;
        let pool = self.pool.clone();
        let instance_uuid = *instance_id.as_uuid();
        let user_uuid = *key.as_uuid();

        handle.block_on(async {
            let span = Span::current();
            span.record("operation", "get_user_row");

            let row = sqlx::query(
                r#"
                SELECT
                    user_id, resource_owner, schema_id, schema_revision, data,
                    email, email_verified, phone, phone_verified,
                    created_at, changed_at, sequence
                FROM projections_users
                WHERE instance_id = $1 AND user_id = $2
                "#,
            )
            .bind(instance_uuid)
            .bind(user_uuid)
            .fetch_optional(&*pool)
            .await
            .ok()??;

            user_row_from(&row)
        })
    }

    fn list(&self, instance_id: InstanceId) -> Vec<UserRow> {
        let handle = match runtime_handle() {
            Some(h) => h,
            None => return vec![],
        };
        let pool = self.pool.clone();
        let instance_uuid = *instance_id.as_uuid();

        handle.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT
                    user_id, resource_owner, schema_id, schema_revision, data,
                    email, email_verified, phone, phone_verified,
                    created_at, changed_at, sequence
                FROM projections_users
                WHERE instance_id = $1
                ORDER BY changed_at DESC
                "#,
            )
            .bind(instance_uuid)
            .fetch_all(&*pool)
            .await
            .unwrap_or_default();

            rows.iter().filter_map(user_row_from).collect()
        })
    }

    fn watermark(&self, handler: &str, instance_id: InstanceId) -> Position {
        let Some(handle) = runtime_handle() else {
            return Position::ZERO;
        };
        let pool = self.pool.clone();
        let handler = handler.to_string();

        handle
            .block_on(async { read_watermark(&pool, &handler, instance_id).await })
            .unwrap_or(Position::ZERO)
    }

    fn apply(
        &self,
        handler: &str,
        instance_id: InstanceId,
        statements: &[Statement<AggregateId, UserRow, UserRowChange>],
        watermark: Position,
    ) -> Result<(), ProjectionError> {
        let handle = runtime_handle().ok_or_else(|| {
            ProjectionError::Apply("PostgresUserTable requires an async runtime (tokio)".to_string())
        })?;
        let pool = self.pool.clone();
        let instance_uuid = *instance_id.as_uuid();

        handle.block_on(async {
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| ProjectionError::Apply(format!("begin: {e}")))?;

            for statement in statements {
                apply_user_statement(&mut tx, instance_uuid, statement)
                    .await
                    .map_err(|e| ProjectionError::Apply(format!("statement: {e}")))?;
            }

            advance_watermark(&mut tx, handler, instance_id, watermark)
                .await
                .map_err(|e| ProjectionError::Apply(format!("watermark: {e}")))?;

            tx.commit()
                .await
                .map_err(|e| ProjectionError::Apply(format!("commit: {e}")))
        })
    }

    fn clear_instance(&self, instance_id: InstanceId) {
        let Some(handle) = runtime_handle() else {
            return;
        };
        let pool = self.pool.clone();
        let instance_uuid = *instance_id.as_uuid();

        let _ = handle.block_on(async {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM projections_users WHERE instance_id = $1")
                .bind(instance_uuid)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "DELETE FROM projection_watermarks WHERE handler = $1 AND instance_id = $2",
            )
            .bind(super::users::USERS_PROJECTION)
            .bind(instance_uuid)
            .execute(&mut *tx)
            .await?;
            tx.commit().await
        });
    }
}

async fn apply_user_statement(
    tx: &mut Transaction<'_, Postgres>,
    instance_uuid: uuid::Uuid,
    statement: &Statement<AggregateId, UserRow, UserRowChange>,
) -> Result<(), sqlx::Error> {
    match &statement.op {
        RowOp::Upsert { key, row } => {
            sqlx::query(
                r#"
                INSERT INTO projections_users (
                    instance_id, user_id, resource_owner, schema_id, schema_revision,
                    data, email, email_verified, phone, phone_verified,
                    created_at, changed_at, sequence
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (instance_id, user_id)
                DO UPDATE SET
                    resource_owner = EXCLUDED.resource_owner,
                    schema_id = EXCLUDED.schema_id,
                    schema_revision = EXCLUDED.schema_revision,
                    data = EXCLUDED.data,
                    email = EXCLUDED.email,
                    email_verified = EXCLUDED.email_verified,
                    phone = EXCLUDED.phone,
                    phone_verified = EXCLUDED.phone_verified,
                    created_at = EXCLUDED.created_at,
                    changed_at = EXCLUDED.changed_at,
                    sequence = EXCLUDED.sequence
                "#,
            )
            .bind(instance_uuid)
            .bind(key.as_uuid())
            .bind(row.resource_owner.as_uuid())
            .bind(row.schema_id.as_uuid())
            .bind(row.schema_revision as i32)
            .bind(&row.data)
            .bind(row.email.as_deref())
            .bind(row.email_verified)
            .bind(row.phone.as_deref())
            .bind(row.phone_verified)
            .bind(row.created_at)
            .bind(row.changed_at)
            .bind(row.sequence as i64)
            .execute(&mut **tx)
            .await?;
        }
        RowOp::Change { key, change } => {
            apply_user_change(tx, instance_uuid, *key.as_uuid(), change).await?;
        }
        RowOp::Delete { key } => {
            sqlx::query("DELETE FROM projections_users WHERE instance_id = $1 AND user_id = $2")
                .bind(instance_uuid)
                .bind(key.as_uuid())
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

async fn apply_user_change(
    tx: &mut Transaction<'_, Postgres>,
    instance_uuid: uuid::Uuid,
    user_uuid: uuid::Uuid,
    change: &UserRowChange,
) -> Result<(), sqlx::Error> {
    let sequence = change.sequence as i64;
    let changed_at = change.changed_at;

    match &change.kind {
        UserRowChangeKind::General {
            schema_id,
            schema_revision,
            data,
        } => {
            sqlx::query(
                r#"
                UPDATE projections_users SET
                    schema_id = COALESCE($3, schema_id),
                    schema_revision = COALESCE($4, schema_revision),
                    data = COALESCE($5, data),
                    changed_at = $6,
                    sequence = $7
                WHERE instance_id = $1 AND user_id = $2
                "#,
            )
            .bind(instance_uuid)
            .bind(user_uuid)
            .bind((*schema_id).map(|id| *id.as_uuid()))
            .bind((*schema_revision).map(|r| r as i32))
            .bind(data.as_ref())
            .bind(changed_at)
            .bind(sequence)
            .execute(&mut **tx)
            .await?;
        }
        UserRowChangeKind::EmailUpdated { address } => {
            sqlx::query(
                r#"
                UPDATE projections_users SET
                    email = $3,
                    email_verified = FALSE,
                    changed_at = $4,
                    sequence = $5
                WHERE instance_id = $1 AND user_id = $2
                "#,
            )
            .bind(instance_uuid)
            .bind(user_uuid)
            .bind(address)
            .bind(changed_at)
            .bind(sequence)
            .execute(&mut **tx)
            .await?;
        }
        UserRowChangeKind::EmailVerified => {
            sqlx::query(
                r#"
                UPDATE projections_users SET
                    email_verified = TRUE,
                    changed_at = $3,
                    sequence = $4
                WHERE instance_id = $1 AND user_id = $2
                "#,
            )
            .bind(instance_uuid)
            .bind(user_uuid)
            .bind(changed_at)
            .bind(sequence)
            .execute(&mut **tx)
            .await?;
        }
        UserRowChangeKind::PhoneUpdated { number } => {
            sqlx::query(
                r#"
                UPDATE projections_users SET
                    phone = $3,
                    phone_verified = FALSE,
                    changed_at = $4,
                    sequence = $5
                WHERE instance_id = $1 AND user_id = $2
                "#,
            )
            .bind(instance_uuid)
            .bind(user_uuid)
            .bind(number)
            .bind(changed_at)
            .bind(sequence)
            .execute(&mut **tx)
            .await?;
        }
        UserRowChangeKind::PhoneVerified => {
            sqlx::query(
                r#"
                UPDATE projections_users SET
                    phone_verified = TRUE,
                    changed_at = $3,
                    sequence = $4
                WHERE instance_id = $1 AND user_id = $2
                "#,
            )
            .bind(instance_uuid)
            .bind(user_uuid)
            .bind(changed_at)
            .bind(sequence)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

fn user_row_from(row: &sqlx::postgres::PgRow) -> Option<UserRow> {
    Some(UserRow {
        user_id: AggregateId::from_uuid(row.try_get("user_id").ok()?),
        resource_owner: OrgId::from_uuid(row.try_get("resource_owner").ok()?),
        schema_id: AggregateId::from_uuid(row.try_get("schema_id").ok()?),
        schema_revision: row.try_get::<i32, _>("schema_revision").ok()? as u32,
        data: row.try_get("data").ok()?,
        email: row.try_get("email").ok()?,
        email_verified: row.try_get("email_verified").ok()?,
        phone: row.try_get("phone").ok()?,
        phone_verified: row.try_get("phone_verified").ok()?,
        created_at: row.try_get("created_at").ok()?,
        changed_at: row.try_get("changed_at").ok()?,
        sequence: row.try_get::<i64, _>("sequence").ok()? as u64,
    })
}

/// Postgres table for the limits projection (`projections_limits`).
pub struct PostgresLimitsTable {
    pool: Arc<PgPool>,
}

impl PostgresLimitsTable {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

impl ProjectionTable<OrgId, LimitsRow, NoChanges> for PostgresLimitsTable {
    fn get(&self, instance_id: InstanceId, key: &OrgId) -> Option<LimitsRow> {
        let handle = runtime_handle()?;
        let pool = self.pool.clone();
        let instance_uuid = *instance_id.as_uuid();
        let owner_uuid = *key.as_uuid();

        handle.block_on(async {
            let row = sqlx::query(
                r#"
                SELECT
                    resource_owner, aggregate_id, audit_log_retention,
                    created_at, changed_at, sequence
                FROM projections_limits
                WHERE instance_id = $1 AND resource_owner = $2
                "#,
            )
            .bind(instance_uuid)
            .bind(owner_uuid)
            .fetch_optional(&*pool)
            .await
            .ok()??;

            limits_row_from(&row)
        })
    }

    fn list(&self, instance_id: InstanceId) -> Vec<LimitsRow> {
        let handle = match runtime_handle() {
            Some(h) => h,
            None => return vec![],
        };
        let pool = self.pool.clone();
        let instance_uuid = *instance_id.as_uuid();

        handle.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT
                    resource_owner, aggregate_id, audit_log_retention,
                    created_at, changed_at, sequence
                FROM projections_limits
                WHERE instance_id = $1
                ORDER BY changed_at DESC
                "#,
            )
            .bind(instance_uuid)
            .fetch_all(&*pool)
            .await
            .unwrap_or_default();

            rows.iter().filter_map(limits_row_from).collect()
        })
    }

    fn watermark(&self, handler: &str, instance_id: InstanceId) -> Position {
        let Some(handle) = runtime_handle() else {
            return Position::ZERO;
        };
        let pool = self.pool.clone();
        let handler = handler.to_string();

        handle
            .block_on(async { read_watermark(&pool, &handler, instance_id).await })
            .unwrap_or(Position::ZERO)
    }

    fn apply(
        &self,
        handler: &str,
        instance_id: InstanceId,
        statements: &[Statement<OrgId, LimitsRow, NoChanges>],
        watermark: Position,
    ) -> Result<(), ProjectionError> {
        let handle = runtime_handle().ok_or_else(|| {
            ProjectionError::Apply(
                "PostgresLimitsTable requires an async runtime (tokio)".to_string(),
            )
        })?;
        let pool = self.pool.clone();
        let instance_uuid = *instance_id.as_uuid();

        handle.block_on(async {
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| ProjectionError::Apply(format!("begin: {e}")))?;

            for statement in statements {
                match &statement.op {
                    RowOp::Upsert { key, row } => {
                        sqlx::query(
                            r#"
                            INSERT INTO projections_limits (
                                instance_id, resource_owner, aggregate_id,
                                audit_log_retention, created_at, changed_at, sequence
                            )
                            VALUES ($1, $2, $3, $4, $5, $6, $7)
                            ON CONFLICT (instance_id, resource_owner)
                            DO UPDATE SET
                                aggregate_id = EXCLUDED.aggregate_id,
                                audit_log_retention = EXCLUDED.audit_log_retention,
                                created_at = EXCLUDED.created_at,
                                changed_at = EXCLUDED.changed_at,
                                sequence = EXCLUDED.sequence
                            "#,
                        )
                        .bind(instance_uuid)
                        .bind(key.as_uuid())
                        .bind(row.aggregate_id.as_uuid())
                        .bind(
                            row.audit_log_retention
                                .map(|d| d.as_nanos() as i64),
                        )
                        .bind(row.created_at)
                        .bind(row.changed_at)
                        .bind(row.sequence as i64)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| ProjectionError::Apply(format!("upsert: {e}")))?;
                    }
                    // NoChanges is uninhabited; the limits projection never
                    // emits column-level changes.
                    RowOp::Change { change, .. } => match *change {},
                    RowOp::Delete { key } => {
                        sqlx::query(
                            "DELETE FROM projections_limits WHERE instance_id = $1 AND resource_owner = $2",
                        )
                        .bind(instance_uuid)
                        .bind(key.as_uuid())
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| ProjectionError::Apply(format!("delete: {e}")))?;
                    }
                }
            }

            advance_watermark(&mut tx, handler, instance_id, watermark)
                .await
                .map_err(|e| ProjectionError::Apply(format!("watermark: {e}")))?;

            tx.commit()
                .await
                .map_err(|e| ProjectionError::Apply(format!("commit: {e}")))
        })
    }

    fn clear_instance(&self, instance_id: InstanceId) {
        let Some(handle) = runtime_handle() else {
            return;
        };
        let pool = self.pool.clone();
        let instance_uuid = *instance_id.as_uuid();

        let _ = handle.block_on(async {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM projections_limits WHERE instance_id = $1")
                .bind(instance_uuid)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "DELETE FROM projection_watermarks WHERE handler = $1 AND instance_id = $2",
            )
            .bind(super::limits::LIMITS_PROJECTION)
            .bind(instance_uuid)
            .execute(&mut *tx)
            .await?;
            tx.commit().await
        });
    }
}

fn limits_row_from(row: &sqlx::postgres::PgRow) -> Option<LimitsRow> {
    let retention: Option<i64> = row.try_get("audit_log_retention").ok()?;
    Some(LimitsRow {
        resource_owner: OrgId::from_uuid(row.try_get("resource_owner").ok()?),
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").ok()?),
        audit_log_retention: retention.map(|n| Duration::from_nanos(n as u64)),
        created_at: row.try_get("created_at").ok()?,
        changed_at: row.try_get("changed_at").ok()?,
        sequence: row.try_get::<i64, _>("sequence").ok()? as u64,
    })
}
