//! `keyforge-users` — schema-user aggregate (write side).
//!
//! A schema user is an identity whose data shape is governed by a user schema
//! aggregate. Email and phone are sub-entities with their own verification
//! lifecycle; verification codes are persisted encrypted only.

pub mod contact;
pub mod user;

pub use contact::{Email, EncryptedCode, Phone};
pub use user::{
    EmailCodeAdded, EmailUpdated, EmailVerified, PhoneCodeAdded, PhoneUpdated, PhoneVerified,
    SchemaUserWriteModel, UserCreated, UserDeleted, UserEvent, UserUpdated, event_types,
};

/// Aggregate type tag for schema users.
pub const AGGREGATE_TYPE: &str = "user";
