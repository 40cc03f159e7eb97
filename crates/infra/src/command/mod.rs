//! Command execution pipeline (application-level orchestration).
//!
//! The [`Commands`] processor owns the full write-side lifecycle:
//!
//! ```text
//! Intent
//!   ↓
//! 1. Structural validation (fail fast, never touches the store)
//!   ↓
//! 2. Load referenced aggregates (schema) and require existence
//!   ↓
//! 3. Load the target write model (filter + fold the full history)
//!   ↓
//! 4. Authorize via the injected permission check
//!   ↓
//! 5. Ask the write model for the event delta (pure decision)
//!   ↓
//! 6. Empty delta → success without an append (idempotent no-op)
//!   ↓
//! 7. Append atomically, guarded by the write model's last-seen sequence
//!   ↓
//! 8. Return a consistency token (sequence + position) for read-your-writes
//! ```
//!
//! A concurrency conflict restarts the pipeline from step 3 with fresh state,
//! bounded by a small attempt budget. Re-validating from fresh state is what
//! makes the retry safe: a command that became a no-op (or illegal) after the
//! conflicting write simply resolves that way on the second pass.

pub mod collaborators;
pub mod details;
pub mod limits;
pub mod schema;
pub mod user;

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use keyforge_core::{DomainError, InstanceId, OrgId, UserId};
use keyforge_events::{Event, EventEnvelope, WriteModel};

use crate::event_store::{
    EventStore, EventStoreError, SearchQuery, SequenceGuard, StoredEvent, UncommittedEvent,
};

pub use collaborators::{
    EncryptedCodeGenerator, IdGenerator, PermissionCheck, UuidGenerator,
};
pub use details::ObjectDetails;
pub use limits::SetLimits;
pub use schema::{CreateUserSchema, UpdateUserSchema};
pub use user::{ChangeSchemaUser, CreateSchemaUser, SchemaUpdate, SchemaUserResult};

/// Permissions checked at the command boundary.
pub mod permissions {
    pub const USER_WRITE: &str = "user.write";
    pub const USER_DELETE: &str = "user.delete";
    pub const USER_SCHEMA_WRITE: &str = "user_schema.write";
    pub const LIMITS_WRITE: &str = "limits.write";
}

/// Default bound for conflict retries (reload + re-execute).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Command execution error: domain failures plus store-level faults.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Infrastructure failure talking to the event store.
    #[error("event store: {0}")]
    Store(EventStoreError),
}

impl From<EventStoreError> for CommandError {
    fn from(value: EventStoreError) -> Self {
        match value {
            // Store-level CAS failures are domain conflicts: the caller (or
            // the retry loop) reloads and retries.
            EventStoreError::Concurrency(msg) => CommandError::Domain(DomainError::conflict(msg)),
            other => CommandError::Store(other),
        }
    }
}

impl CommandError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommandError::Domain(e) if e.is_retryable())
    }
}

/// Ambient request context: which instance, acting as whom.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub instance_id: InstanceId,
    pub actor: UserId,
}

impl CommandContext {
    pub fn new(instance_id: InstanceId, actor: UserId) -> Self {
        Self { instance_id, actor }
    }
}

/// The write-side command processor.
///
/// Generic over the event store so tests run against the in-memory backend
/// and production against Postgres (optionally wrapped in
/// `PublishingEventStore` for live projection wakeups).
pub struct Commands<S> {
    store: S,
    id_generator: Arc<dyn IdGenerator>,
    permission_check: Arc<dyn PermissionCheck>,
    code_generator: Arc<dyn EncryptedCodeGenerator>,
    max_attempts: u32,
}

impl<S> Commands<S> {
    pub fn new(
        store: S,
        id_generator: Arc<dyn IdGenerator>,
        permission_check: Arc<dyn PermissionCheck>,
        code_generator: Arc<dyn EncryptedCodeGenerator>,
    ) -> Self {
        Self {
            store,
            id_generator,
            permission_check,
            code_generator,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Override the conflict retry budget (must be at least 1).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

impl<S> Commands<S> {
    fn id_generator(&self) -> &dyn IdGenerator {
        self.id_generator.as_ref()
    }

    fn code_generator(&self) -> Arc<dyn EncryptedCodeGenerator> {
        self.code_generator.clone()
    }
}

impl<S> Commands<S>
where
    S: EventStore,
{
    /// Run `op` until it succeeds or fails with a non-retryable error.
    ///
    /// Each attempt re-executes the full load-validate-append pipeline, so a
    /// conflicting writer's events are folded before the retry decides again.
    fn with_retry<T>(
        &self,
        mut op: impl FnMut() -> Result<T, CommandError>,
    ) -> Result<T, CommandError> {
        let mut attempt = 1;
        loop {
            match op() {
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    tracing::debug!(attempt, error = %err, "command conflicted, reloading and retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Rebuild a write model by filtering and folding its full history.
    ///
    /// Pages through the store so long streams never load at once; envelopes
    /// arrive in ascending `(position, sequence)` order, which for a single
    /// aggregate is sequence order.
    fn load_write_model<W: WriteModel>(&self, write_model: &mut W) -> Result<(), CommandError> {
        let base = SearchQuery::for_instance(write_model.state().instance_id())
            .with_aggregate_type(write_model.aggregate_type())
            .with_aggregate_id(write_model.state().aggregate_id());

        let mut cursor = None;
        loop {
            let mut query = base.clone();
            if let Some(position) = cursor {
                query = query.with_position_after(position);
            }
            let page = self.store.filter(&query)?;
            let envelopes: Vec<EventEnvelope<JsonValue>> =
                page.events.iter().map(StoredEvent::to_envelope).collect();
            write_model.reduce(envelopes.iter())?;

            match page.continuation {
                Some(position) => cursor = Some(position),
                None => return Ok(()),
            }
        }
    }

    /// Check a capability for the actor against a resource owner + aggregate.
    fn check_permission(
        &self,
        ctx: &CommandContext,
        resource_owner: OrgId,
        permission: &str,
        aggregate_id: keyforge_core::AggregateId,
    ) -> Result<(), CommandError> {
        self.permission_check
            .check(ctx.instance_id, resource_owner, permission, aggregate_id)
            .map_err(CommandError::from)
    }

    /// Append a write model's event delta under its sequence guard.
    fn push<W, E>(
        &self,
        ctx: &CommandContext,
        write_model: &W,
        resource_owner: OrgId,
        events: &[E],
    ) -> Result<Vec<StoredEvent>, CommandError>
    where
        W: WriteModel,
        E: Event + Serialize,
    {
        let aggregate_id = write_model.state().aggregate_id();
        let uncommitted = events
            .iter()
            .map(|event| {
                UncommittedEvent::from_typed(
                    ctx.instance_id,
                    resource_owner,
                    aggregate_id,
                    write_model.aggregate_type(),
                    ctx.actor,
                    Uuid::now_v7(),
                    event,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let guard = SequenceGuard::exact(aggregate_id, write_model.state().sequence());
        let committed = self.store.append(uncommitted, &[guard])?;
        Ok(committed)
    }

    /// Build the consistency token from the append result, falling back to
    /// the folded state for idempotent no-ops.
    fn details_for<W: WriteModel>(
        &self,
        write_model: &W,
        resource_owner: OrgId,
        committed: &[StoredEvent],
    ) -> ObjectDetails {
        match committed.last() {
            Some(last) => ObjectDetails {
                id: last.aggregate_id,
                resource_owner: last.resource_owner,
                sequence: last.sequence,
                position: last.position,
                changed_at: last.created_at,
            },
            None => ObjectDetails {
                id: write_model.state().aggregate_id(),
                resource_owner: write_model.state().resource_owner().unwrap_or(resource_owner),
                sequence: write_model.state().sequence(),
                position: write_model.state().position(),
                changed_at: write_model
                    .state()
                    .changed_at()
                    .unwrap_or_else(chrono::Utc::now),
            },
        }
    }
}
