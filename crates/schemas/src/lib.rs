//! `keyforge-schemas` — user-schema aggregate (write side).
//!
//! A user schema describes the shape of schema-user data: a JSON document with
//! per-field permission annotations. Users reference a schema by ID and are
//! validated against the revision they were created with.

pub mod schema;

pub use schema::{
    FieldRole, UserSchemaCreated, UserSchemaDeactivated, UserSchemaDeleted, UserSchemaEvent,
    UserSchemaReactivated, UserSchemaUpdated, UserSchemaWriteModel, event_types, field_writable,
};

/// Aggregate type tag for user schemas.
pub const AGGREGATE_TYPE: &str = "user_schema";
