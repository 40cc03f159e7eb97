//! Projection implementations (read model builders).
//!
//! Projections consume the event stream and maintain query-optimized tables.
//! All projections are:
//! - **Rebuildable**: clear the instance and catch up from position zero
//! - **Instance-isolated**: rows are partitioned by instance
//! - **Idempotent**: statements are upserts/deletes keyed by natural key,
//!   safe under at-least-once processing

pub mod handler;
pub mod limits;
pub mod postgres;
pub mod statement;
pub mod table;
pub mod users;

use thiserror::Error;

use crate::event_store::EventStoreError;

pub use handler::ProjectionHandler;
pub use limits::{LIMITS_PROJECTION, LimitsRow, limits_projection};
pub use postgres::{PostgresLimitsTable, PostgresUserTable};
pub use statement::{NoChanges, RowChange, RowOp, Statement};
pub use table::{InMemoryProjectionTable, ProjectionTable};
pub use users::{USERS_PROJECTION, UserRow, UserRowChange, users_projection};

/// Projection processing error.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("event store error: {0}")]
    Store(#[from] EventStoreError),

    /// A registered event-to-statement mapping failed. Fatal for the
    /// handler: continuing would silently corrupt the read model.
    #[error("failed to fold event into a statement: {0}")]
    Fold(String),

    /// Applying a statement batch (or advancing the watermark) failed.
    #[error("failed to apply statements: {0}")]
    Apply(String),
}
