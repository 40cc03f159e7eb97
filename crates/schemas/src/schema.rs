use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use keyforge_core::{AggregateId, DomainError, DomainResult, InstanceId};
use keyforge_events::{Event, EventEnvelope, WriteModel, WriteModelState};

/// Stable event type tags for the user-schema aggregate.
pub mod event_types {
    pub const CREATED: &str = "user_schema.created";
    pub const UPDATED: &str = "user_schema.updated";
    pub const DEACTIVATED: &str = "user_schema.deactivated";
    pub const REACTIVATED: &str = "user_schema.reactivated";
    pub const DELETED: &str = "user_schema.deleted";
}

/// Role of the actor writing schema-user data.
///
/// `Owner` is anyone managing another user (org admin); `Self_` is a user
/// editing their own record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldRole {
    Owner,
    #[serde(rename = "self")]
    Self_,
}

impl FieldRole {
    fn key(self) -> &'static str {
        match self {
            FieldRole::Owner => "owner",
            FieldRole::Self_ => "self",
        }
    }
}

/// The opaque field-permission predicate: a grant string makes a field
/// writable iff it contains `w` (`"rw"`, `"w"`). `"r"` and `""` are read-only.
pub fn field_writable(grant: &str) -> bool {
    grant.contains('w')
}

/// Event: UserSchemaCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSchemaCreated {
    pub schema_type: String,
    pub document: JsonValue,
}

/// Event: UserSchemaUpdated.
///
/// `revision` is present exactly when `document` is: changing the document
/// bumps the revision, renaming the type does not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSchemaUpdated {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
}

/// Event: UserSchemaDeactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSchemaDeactivated {}

/// Event: UserSchemaReactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSchemaReactivated {}

/// Event: UserSchemaDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSchemaDeleted {}

/// All events of the user-schema aggregate.
///
/// Untagged: the payload on the wire is the plain event struct; the type tag
/// travels in the stream metadata, not in the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum UserSchemaEvent {
    Created(UserSchemaCreated),
    Updated(UserSchemaUpdated),
    Deactivated(UserSchemaDeactivated),
    Reactivated(UserSchemaReactivated),
    Deleted(UserSchemaDeleted),
}

impl Event for UserSchemaEvent {
    fn event_type(&self) -> &'static str {
        match self {
            UserSchemaEvent::Created(_) => event_types::CREATED,
            UserSchemaEvent::Updated(_) => event_types::UPDATED,
            UserSchemaEvent::Deactivated(_) => event_types::DEACTIVATED,
            UserSchemaEvent::Reactivated(_) => event_types::REACTIVATED,
            UserSchemaEvent::Deleted(_) => event_types::DELETED,
        }
    }

    fn version(&self) -> u32 {
        1
    }
}

/// Write model for one user schema.
///
/// Rebuilt per command by folding the aggregate's history; owns the
/// data-vs-schema validation used when creating or changing schema users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSchemaWriteModel {
    state: WriteModelState,
    created: bool,
    deleted: bool,
    active: bool,
    schema_type: String,
    document: JsonValue,
    revision: u32,
}

impl UserSchemaWriteModel {
    /// Create an empty, not-yet-created model for rehydration.
    pub fn new(instance_id: InstanceId, aggregate_id: AggregateId) -> Self {
        Self {
            state: WriteModelState::new(instance_id, aggregate_id),
            created: false,
            deleted: false,
            active: false,
            schema_type: String::new(),
            document: JsonValue::Null,
            revision: 0,
        }
    }

    pub fn schema_id(&self) -> AggregateId {
        self.state.aggregate_id()
    }

    pub fn schema_type(&self) -> &str {
        &self.schema_type
    }

    pub fn document(&self) -> &JsonValue {
        &self.document
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn is_active(&self) -> bool {
        self.exists() && self.active
    }

    /// Validate schema-user data against this schema for the given actor role.
    ///
    /// - data must be a non-empty JSON object
    /// - fields with a `"permission"` annotation must be writable for `role`
    /// - unknown fields are rejected when `"additionalProperties": false`
    pub fn check_data(&self, role: FieldRole, data: &JsonValue) -> DomainResult<()> {
        let Some(fields) = data.as_object() else {
            return Err(DomainError::invalid_argument("user data must be a JSON object"));
        };
        if fields.is_empty() {
            return Err(DomainError::invalid_argument("user data must not be empty"));
        }

        let properties = self.document.get("properties").and_then(|p| p.as_object());
        let additional_allowed = self
            .document
            .get("additionalProperties")
            .and_then(|a| a.as_bool())
            .unwrap_or(true);

        for field in fields.keys() {
            let property = properties.and_then(|p| p.get(field));
            match property {
                Some(property) => {
                    let grant = property
                        .get("permission")
                        .and_then(|p| p.get(role.key()))
                        .and_then(|g| g.as_str());
                    if let Some(grant) = grant {
                        if !field_writable(grant) {
                            return Err(DomainError::precondition(format!(
                                "field '{field}' is not writable for role '{}'",
                                role.key()
                            )));
                        }
                    }
                }
                None => {
                    if !additional_allowed {
                        return Err(DomainError::precondition(format!(
                            "field '{field}' is not defined by the schema"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Produce the creation event.
    pub fn new_create(
        &self,
        schema_type: &str,
        document: JsonValue,
    ) -> DomainResult<Vec<UserSchemaEvent>> {
        if self.created {
            return Err(DomainError::precondition("user schema already exists"));
        }
        if schema_type.trim().is_empty() {
            return Err(DomainError::invalid_argument("schema type must not be empty"));
        }
        if !document.is_object() {
            return Err(DomainError::invalid_argument(
                "schema document must be a JSON object",
            ));
        }

        Ok(vec![UserSchemaEvent::Created(UserSchemaCreated {
            schema_type: schema_type.to_string(),
            document,
        })])
    }

    /// Produce the minimal update delta. Unchanged values emit nothing.
    pub fn new_update(
        &self,
        schema_type: Option<&str>,
        document: Option<JsonValue>,
    ) -> DomainResult<Vec<UserSchemaEvent>> {
        if !self.exists() {
            return Err(DomainError::not_found());
        }

        let new_type = match schema_type {
            Some(t) if t != self.schema_type => {
                if t.trim().is_empty() {
                    return Err(DomainError::invalid_argument("schema type must not be empty"));
                }
                Some(t.to_string())
            }
            _ => None,
        };

        let new_document = match document {
            Some(d) if d != self.document => {
                if !d.is_object() {
                    return Err(DomainError::invalid_argument(
                        "schema document must be a JSON object",
                    ));
                }
                Some(d)
            }
            _ => None,
        };

        if new_type.is_none() && new_document.is_none() {
            return Ok(vec![]);
        }

        let revision = new_document.is_some().then(|| self.revision + 1);

        Ok(vec![UserSchemaEvent::Updated(UserSchemaUpdated {
            schema_type: new_type,
            document: new_document,
            revision,
        })])
    }

    pub fn new_deactivate(&self) -> DomainResult<Vec<UserSchemaEvent>> {
        if !self.exists() {
            return Err(DomainError::not_found());
        }
        if !self.active {
            return Err(DomainError::precondition("user schema is already inactive"));
        }
        Ok(vec![UserSchemaEvent::Deactivated(UserSchemaDeactivated {})])
    }

    pub fn new_reactivate(&self) -> DomainResult<Vec<UserSchemaEvent>> {
        if !self.exists() {
            return Err(DomainError::not_found());
        }
        if self.active {
            return Err(DomainError::precondition("user schema is already active"));
        }
        Ok(vec![UserSchemaEvent::Reactivated(UserSchemaReactivated {})])
    }

    pub fn new_delete(&self) -> DomainResult<Vec<UserSchemaEvent>> {
        if !self.exists() {
            return Err(DomainError::not_found());
        }
        Ok(vec![UserSchemaEvent::Deleted(UserSchemaDeleted {})])
    }
}

impl WriteModel for UserSchemaWriteModel {
    fn aggregate_type(&self) -> &'static str {
        crate::AGGREGATE_TYPE
    }

    fn state(&self) -> &WriteModelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut WriteModelState {
        &mut self.state
    }

    fn apply(&mut self, envelope: &EventEnvelope<JsonValue>) -> DomainResult<()> {
        match envelope.event_type() {
            event_types::CREATED => {
                let e: UserSchemaCreated = deserialize_payload(envelope)?;
                self.created = true;
                self.deleted = false;
                self.active = true;
                self.schema_type = e.schema_type;
                self.document = e.document;
                self.revision = 1;
            }
            event_types::UPDATED => {
                let e: UserSchemaUpdated = deserialize_payload(envelope)?;
                if let Some(t) = e.schema_type {
                    self.schema_type = t;
                }
                if let Some(d) = e.document {
                    self.document = d;
                }
                if let Some(r) = e.revision {
                    self.revision = r;
                }
            }
            event_types::DEACTIVATED => self.active = false,
            event_types::REACTIVATED => self.active = true,
            event_types::DELETED => self.deleted = true,
            // Unknown event types are ignored for forward compatibility.
            _ => {}
        }
        Ok(())
    }

    fn exists(&self) -> bool {
        self.created && !self.deleted
    }
}

fn deserialize_payload<T: serde::de::DeserializeOwned>(
    envelope: &EventEnvelope<JsonValue>,
) -> DomainResult<T> {
    serde_json::from_value(envelope.payload().clone()).map_err(|e| {
        DomainError::corrupted(format!(
            "undecodable '{}' payload at sequence {}: {e}",
            envelope.event_type(),
            envelope.sequence()
        ))
    })
}
