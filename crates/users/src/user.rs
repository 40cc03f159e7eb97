use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use keyforge_core::{AggregateId, DomainError, DomainResult, InstanceId};
use keyforge_events::{Event, EventEnvelope, WriteModel, WriteModelState};
use keyforge_schemas::{FieldRole, UserSchemaWriteModel};

use crate::contact::{Email, EncryptedCode, Phone};

/// Stable event type tags for the schema-user aggregate.
pub mod event_types {
    pub const CREATED: &str = "user.created";
    pub const UPDATED: &str = "user.updated";
    pub const DELETED: &str = "user.deleted";
    pub const EMAIL_UPDATED: &str = "user.email.updated";
    pub const EMAIL_CODE_ADDED: &str = "user.email.code.added";
    pub const EMAIL_VERIFIED: &str = "user.email.verified";
    pub const PHONE_UPDATED: &str = "user.phone.updated";
    pub const PHONE_CODE_ADDED: &str = "user.phone.code.added";
    pub const PHONE_VERIFIED: &str = "user.phone.verified";
}

/// Event: UserCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreated {
    pub schema_id: AggregateId,
    pub schema_revision: u32,
    pub data: JsonValue,
}

/// Event: UserUpdated. Only changed fields are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdated {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<AggregateId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_revision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

/// Event: UserDeleted (terminal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDeleted {}

/// Event: EmailUpdated. Resets the verified flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailUpdated {
    pub address: String,
}

/// Event: EmailCodeAdded. `code` is the encrypted form; the plaintext never
/// enters the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailCodeAdded {
    pub code: String,
}

/// Event: EmailVerified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailVerified {}

/// Event: PhoneUpdated. Carries the normalized number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneUpdated {
    pub number: String,
}

/// Event: PhoneCodeAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneCodeAdded {
    pub code: String,
}

/// Event: PhoneVerified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneVerified {}

/// All events of the schema-user aggregate (untagged payloads).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum UserEvent {
    Created(UserCreated),
    Updated(UserUpdated),
    Deleted(UserDeleted),
    EmailUpdated(EmailUpdated),
    EmailCodeAdded(EmailCodeAdded),
    EmailVerified(EmailVerified),
    PhoneUpdated(PhoneUpdated),
    PhoneCodeAdded(PhoneCodeAdded),
    PhoneVerified(PhoneVerified),
}

impl Event for UserEvent {
    fn event_type(&self) -> &'static str {
        match self {
            UserEvent::Created(_) => event_types::CREATED,
            UserEvent::Updated(_) => event_types::UPDATED,
            UserEvent::Deleted(_) => event_types::DELETED,
            UserEvent::EmailUpdated(_) => event_types::EMAIL_UPDATED,
            UserEvent::EmailCodeAdded(_) => event_types::EMAIL_CODE_ADDED,
            UserEvent::EmailVerified(_) => event_types::EMAIL_VERIFIED,
            UserEvent::PhoneUpdated(_) => event_types::PHONE_UPDATED,
            UserEvent::PhoneCodeAdded(_) => event_types::PHONE_CODE_ADDED,
            UserEvent::PhoneVerified(_) => event_types::PHONE_VERIFIED,
        }
    }

    fn version(&self) -> u32 {
        1
    }
}

/// Write model for one schema user.
///
/// Lifecycle: nonexistent → active → deleted (terminal). Every command except
/// creation requires the active state; creation requires nonexistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaUserWriteModel {
    state: WriteModelState,
    created: bool,
    deleted: bool,
    schema_id: Option<AggregateId>,
    schema_revision: u32,
    data: JsonValue,
    email: Option<String>,
    email_verified: bool,
    email_code: Option<String>,
    phone: Option<String>,
    phone_verified: bool,
    phone_code: Option<String>,
}

impl SchemaUserWriteModel {
    /// Create an empty, not-yet-created model for rehydration.
    pub fn new(instance_id: InstanceId, aggregate_id: AggregateId) -> Self {
        Self {
            state: WriteModelState::new(instance_id, aggregate_id),
            created: false,
            deleted: false,
            schema_id: None,
            schema_revision: 0,
            data: JsonValue::Null,
            email: None,
            email_verified: false,
            email_code: None,
            phone: None,
            phone_verified: false,
            phone_code: None,
        }
    }

    pub fn user_id(&self) -> AggregateId {
        self.state.aggregate_id()
    }

    pub fn schema_id(&self) -> Option<AggregateId> {
        self.schema_id
    }

    pub fn schema_revision(&self) -> u32 {
        self.schema_revision
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn email_verified(&self) -> bool {
        self.email_verified
    }

    /// Encrypted verification code currently pending for the email, if any.
    pub fn email_code(&self) -> Option<&str> {
        self.email_code.as_deref()
    }

    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }

    pub fn phone_verified(&self) -> bool {
        self.phone_verified
    }

    pub fn phone_code(&self) -> Option<&str> {
        self.phone_code.as_deref()
    }

    /// Produce the creation delta.
    ///
    /// Returns the events plus the plaintext email/phone verification codes
    /// when the respective intent asked for a return code.
    pub fn new_create<F>(
        &self,
        schema: &UserSchemaWriteModel,
        data: JsonValue,
        email: Option<&Email>,
        phone: Option<&Phone>,
        role: FieldRole,
        mut new_code: F,
    ) -> DomainResult<(Vec<UserEvent>, Option<String>, Option<String>)>
    where
        F: FnMut() -> DomainResult<EncryptedCode>,
    {
        if self.created {
            return Err(DomainError::precondition("user already exists"));
        }
        if !schema.is_active() {
            return Err(DomainError::precondition("user schema is not active"));
        }
        schema.check_data(role, &data)?;

        let mut events = vec![UserEvent::Created(UserCreated {
            schema_id: schema.schema_id(),
            schema_revision: schema.revision(),
            data,
        })];

        let email_code = match email {
            Some(email) => push_email_events(&mut events, email, &mut new_code)?,
            None => None,
        };
        let phone_code = match phone {
            Some(phone) => push_phone_events(&mut events, phone, &mut new_code)?,
            None => None,
        };

        Ok((events, email_code, phone_code))
    }

    /// Produce the minimal update delta; equal values emit nothing.
    ///
    /// `schema` must be supplied when `data` is: it is the schema to validate
    /// against, either the user's current one or a newly referenced one.
    pub fn new_update<F>(
        &self,
        schema: Option<&UserSchemaWriteModel>,
        data: Option<JsonValue>,
        email: Option<&Email>,
        phone: Option<&Phone>,
        role: FieldRole,
        mut new_code: F,
    ) -> DomainResult<(Vec<UserEvent>, Option<String>, Option<String>)>
    where
        F: FnMut() -> DomainResult<EncryptedCode>,
    {
        if !self.exists() {
            return Err(DomainError::not_found());
        }

        let mut events = Vec::new();

        if let Some(schema) = schema {
            if !schema.is_active() {
                return Err(DomainError::precondition("user schema is not active"));
            }

            let schema_changed = self.schema_id != Some(schema.schema_id())
                || self.schema_revision != schema.revision();

            let new_data = match data {
                Some(data) => {
                    schema.check_data(role, &data)?;
                    (data != self.data).then_some(data)
                }
                None => None,
            };

            if schema_changed || new_data.is_some() {
                events.push(UserEvent::Updated(UserUpdated {
                    schema_id: schema_changed.then(|| schema.schema_id()),
                    schema_revision: schema_changed.then(|| schema.revision()),
                    data: new_data,
                }));
            }
        } else if data.is_some() {
            return Err(DomainError::invalid_argument(
                "data changes require the schema to validate against",
            ));
        }

        let email_code = match email {
            Some(email) if self.email.as_deref() != Some(email.address.as_str()) => {
                push_email_events(&mut events, email, &mut new_code)?
            }
            _ => None,
        };
        let phone_code = match phone {
            Some(phone) if self.phone.as_deref() != Some(phone.number.as_str()) => {
                push_phone_events(&mut events, phone, &mut new_code)?
            }
            _ => None,
        };

        Ok((events, email_code, phone_code))
    }

    /// Produce the deletion delta.
    pub fn new_delete(&self) -> DomainResult<Vec<UserEvent>> {
        if !self.exists() {
            return Err(DomainError::not_found());
        }
        Ok(vec![UserEvent::Deleted(UserDeleted {})])
    }
}

fn push_email_events<F>(
    events: &mut Vec<UserEvent>,
    email: &Email,
    new_code: &mut F,
) -> DomainResult<Option<String>>
where
    F: FnMut() -> DomainResult<EncryptedCode>,
{
    events.push(UserEvent::EmailUpdated(EmailUpdated {
        address: email.address.clone(),
    }));

    if email.verified {
        events.push(UserEvent::EmailVerified(EmailVerified {}));
        return Ok(None);
    }

    let code = new_code()?;
    events.push(UserEvent::EmailCodeAdded(EmailCodeAdded {
        code: code.encrypted,
    }));
    Ok(email.return_code.then_some(code.plain))
}

fn push_phone_events<F>(
    events: &mut Vec<UserEvent>,
    phone: &Phone,
    new_code: &mut F,
) -> DomainResult<Option<String>>
where
    F: FnMut() -> DomainResult<EncryptedCode>,
{
    events.push(UserEvent::PhoneUpdated(PhoneUpdated {
        number: phone.number.clone(),
    }));

    if phone.verified {
        events.push(UserEvent::PhoneVerified(PhoneVerified {}));
        return Ok(None);
    }

    let code = new_code()?;
    events.push(UserEvent::PhoneCodeAdded(PhoneCodeAdded {
        code: code.encrypted,
    }));
    Ok(phone.return_code.then_some(code.plain))
}

impl WriteModel for SchemaUserWriteModel {
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
                let e: UserCreated = deserialize_payload(envelope)?;
                self.created = true;
                self.deleted = false;
                self.schema_id = Some(e.schema_id);
                self.schema_revision = e.schema_revision;
                self.data = e.data;
            }
            event_types::UPDATED => {
                let e: UserUpdated = deserialize_payload(envelope)?;
                if let Some(schema_id) = e.schema_id {
                    self.schema_id = Some(schema_id);
                }
                if let Some(revision) = e.schema_revision {
                    self.schema_revision = revision;
                }
                if let Some(data) = e.data {
                    self.data = data;
                }
            }
            event_types::DELETED => self.deleted = true,
            event_types::EMAIL_UPDATED => {
                let e: EmailUpdated = deserialize_payload(envelope)?;
                self.email = Some(e.address);
                self.email_verified = false;
                self.email_code = None;
            }
            event_types::EMAIL_CODE_ADDED => {
                let e: EmailCodeAdded = deserialize_payload(envelope)?;
                self.email_code = Some(e.code);
            }
            event_types::EMAIL_VERIFIED => {
                self.email_verified = true;
                self.email_code = None;
            }
            event_types::PHONE_UPDATED => {
                let e: PhoneUpdated = deserialize_payload(envelope)?;
                self.phone = Some(e.number);
                self.phone_verified = false;
                self.phone_code = None;
            }
            event_types::PHONE_CODE_ADDED => {
                let e: PhoneCodeAdded = deserialize_payload(envelope)?;
                self.phone_code = Some(e.code);
            }
            event_types::PHONE_VERIFIED => {
                self.phone_verified = true;
                self.phone_code = None;
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keyforge_core::{OrgId, Position, UserId};
    use keyforge_schemas::{UserSchemaCreated, event_types as schema_event_types};
    use serde_json::json;
    use uuid::Uuid;

    fn test_code() -> DomainResult<EncryptedCode> {
        Ok(EncryptedCode {
            encrypted: "enc:code".to_string(),
            plain: "12345678".to_string(),
        })
    }

    fn envelope(
        instance_id: InstanceId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        sequence: u64,
        event_type: &str,
        payload: JsonValue,
    ) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            instance_id,
            OrgId::new(),
            aggregate_id,
            aggregate_type,
            sequence,
            Position::new(sequence),
            event_type,
            UserId::new(),
            Utc::now(),
            payload,
        )
    }

    fn schema(instance_id: InstanceId, document: JsonValue) -> UserSchemaWriteModel {
        let schema_id = AggregateId::new();
        let mut wm = UserSchemaWriteModel::new(instance_id, schema_id);
        let payload = serde_json::to_value(UserSchemaCreated {
            schema_type: "employee".to_string(),
            document,
        })
        .unwrap();
        wm.reduce([&envelope(
            instance_id,
            schema_id,
            keyforge_schemas::AGGREGATE_TYPE,
            1,
            schema_event_types::CREATED,
            payload,
        )])
        .unwrap();
        wm
    }

    fn open_schema(instance_id: InstanceId) -> UserSchemaWriteModel {
        schema(instance_id, json!({"type": "object"}))
    }

    fn created_user(
        instance_id: InstanceId,
        schema: &UserSchemaWriteModel,
        data: JsonValue,
    ) -> SchemaUserWriteModel {
        let user_id = AggregateId::new();
        let mut wm = SchemaUserWriteModel::new(instance_id, user_id);
        let payload = serde_json::to_value(UserCreated {
            schema_id: schema.schema_id(),
            schema_revision: schema.revision(),
            data,
        })
        .unwrap();
        wm.reduce([&envelope(
            instance_id,
            user_id,
            crate::AGGREGATE_TYPE,
            1,
            event_types::CREATED,
            payload,
        )])
        .unwrap();
        wm
    }

    #[test]
    fn new_create_emits_created_and_email_events() {
        let instance_id = InstanceId::new();
        let schema = open_schema(instance_id);
        let wm = SchemaUserWriteModel::new(instance_id, AggregateId::new());
        let email = Email {
            address: "user@example.com".to_string(),
            verified: false,
            return_code: true,
        };

        let (events, email_code, phone_code) = wm
            .new_create(
                &schema,
                json!({"name": "user"}),
                Some(&email),
                None,
                FieldRole::Owner,
                test_code,
            )
            .unwrap();

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], UserEvent::Created(e) if e.schema_revision == 1));
        assert!(
            matches!(&events[1], UserEvent::EmailUpdated(e) if e.address == "user@example.com")
        );
        // Only the encrypted form goes into the stream.
        assert!(matches!(&events[2], UserEvent::EmailCodeAdded(e) if e.code == "enc:code"));
        assert_eq!(email_code.as_deref(), Some("12345678"));
        assert_eq!(phone_code, None);
    }

    #[test]
    fn new_create_with_verified_email_skips_the_code() {
        let instance_id = InstanceId::new();
        let schema = open_schema(instance_id);
        let wm = SchemaUserWriteModel::new(instance_id, AggregateId::new());
        let email = Email {
            address: "user@example.com".to_string(),
            verified: true,
            return_code: false,
        };

        let (events, email_code, _) = wm
            .new_create(
                &schema,
                json!({"name": "user"}),
                Some(&email),
                None,
                FieldRole::Owner,
                || panic!("no code expected for a verified email"),
            )
            .unwrap();

        assert!(matches!(&events[2], UserEvent::EmailVerified(_)));
        assert_eq!(email_code, None);
    }

    #[test]
    fn new_create_rejects_existing_user() {
        let instance_id = InstanceId::new();
        let schema = open_schema(instance_id);
        let wm = created_user(instance_id, &schema, json!({"name": "user"}));

        let err = wm
            .new_create(
                &schema,
                json!({"name": "user"}),
                None,
                None,
                FieldRole::Owner,
                test_code,
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::PreconditionFailed(_)));
    }

    #[test]
    fn new_create_rejects_unwritable_fields() {
        let instance_id = InstanceId::new();
        let schema = schema(
            instance_id,
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "permission": {"owner": "r"}}
                }
            }),
        );
        let wm = SchemaUserWriteModel::new(instance_id, AggregateId::new());

        let err = wm
            .new_create(
                &schema,
                json!({"name": "user"}),
                None,
                None,
                FieldRole::Owner,
                test_code,
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::PreconditionFailed(_)));
    }

    #[test]
    fn new_update_rejects_missing_user() {
        let instance_id = InstanceId::new();
        let wm = SchemaUserWriteModel::new(instance_id, AggregateId::new());
        let err = wm
            .new_update(None, None, None, None, FieldRole::Owner, test_code)
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn new_update_is_noop_for_unchanged_values() {
        let instance_id = InstanceId::new();
        let schema = open_schema(instance_id);
        let mut wm = created_user(instance_id, &schema, json!({"name": "user"}));
        let email_payload = serde_json::to_value(EmailUpdated {
            address: "user@example.com".to_string(),
        })
        .unwrap();
        wm.reduce([&envelope(
            instance_id,
            wm.user_id(),
            crate::AGGREGATE_TYPE,
            2,
            event_types::EMAIL_UPDATED,
            email_payload,
        )])
        .unwrap();

        let (events, email_code, phone_code) = wm
            .new_update(
                Some(&schema),
                Some(json!({"name": "user"})),
                Some(&Email::new("user@example.com")),
                None,
                FieldRole::Owner,
                test_code,
            )
            .unwrap();

        assert!(events.is_empty());
        assert_eq!(email_code, None);
        assert_eq!(phone_code, None);
    }

    #[test]
    fn new_update_emits_minimal_delta() {
        let instance_id = InstanceId::new();
        let schema = open_schema(instance_id);
        let wm = created_user(instance_id, &schema, json!({"name": "user"}));

        let (events, _, _) = wm
            .new_update(
                Some(&schema),
                Some(json!({"name": "renamed"})),
                None,
                None,
                FieldRole::Owner,
                test_code,
            )
            .unwrap();

        assert_eq!(events.len(), 1);
        match &events[0] {
            UserEvent::Updated(e) => {
                assert_eq!(e.data, Some(json!({"name": "renamed"})));
                // Same schema and revision: not repeated in the delta.
                assert!(e.schema_id.is_none());
                assert!(e.schema_revision.is_none());
            }
            other => panic!("expected Updated event, got {other:?}"),
        }
    }

    #[test]
    fn new_update_requires_schema_for_data_changes() {
        let instance_id = InstanceId::new();
        let schema = open_schema(instance_id);
        let wm = created_user(instance_id, &schema, json!({"name": "user"}));

        let err = wm
            .new_update(
                None,
                Some(json!({"name": "renamed"})),
                None,
                None,
                FieldRole::Owner,
                test_code,
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidArgument(_)));
    }

    #[test]
    fn email_change_resets_verification_and_attaches_code() {
        let instance_id = InstanceId::new();
        let schema = open_schema(instance_id);
        let mut wm = created_user(instance_id, &schema, json!({"name": "user"}));

        let (events, _, _) = wm
            .new_update(
                None,
                None,
                Some(&Email::new("new@example.com")),
                None,
                FieldRole::Owner,
                test_code,
            )
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], UserEvent::EmailUpdated(_)));
        assert!(matches!(&events[1], UserEvent::EmailCodeAdded(_)));

        for (offset, event) in events.iter().enumerate() {
            let payload = serde_json::to_value(event).unwrap();
            wm.reduce([&envelope(
                instance_id,
                wm.user_id(),
                crate::AGGREGATE_TYPE,
                2 + offset as u64,
                event.event_type(),
                payload,
            )])
            .unwrap();
        }

        assert_eq!(wm.email(), Some("new@example.com"));
        assert!(!wm.email_verified());
        assert_eq!(wm.email_code(), Some("enc:code"));
    }

    #[test]
    fn deleted_user_rejects_further_commands() {
        let instance_id = InstanceId::new();
        let schema = open_schema(instance_id);
        let mut wm = created_user(instance_id, &schema, json!({"name": "user"}));
        wm.reduce([&envelope(
            instance_id,
            wm.user_id(),
            crate::AGGREGATE_TYPE,
            2,
            event_types::DELETED,
            json!({}),
        )])
        .unwrap();

        assert!(!wm.exists());
        assert_eq!(
            wm.new_update(None, None, None, None, FieldRole::Owner, test_code)
                .unwrap_err(),
            DomainError::NotFound
        );
        assert_eq!(wm.new_delete().unwrap_err(), DomainError::NotFound);
    }

    #[test]
    fn full_replay_matches_incremental_fold() {
        let instance_id = InstanceId::new();
        let user_id = AggregateId::new();
        let schema = open_schema(instance_id);

        let history = vec![
            (
                event_types::CREATED,
                serde_json::to_value(UserCreated {
                    schema_id: schema.schema_id(),
                    schema_revision: 1,
                    data: json!({"name": "user"}),
                })
                .unwrap(),
            ),
            (
                event_types::EMAIL_UPDATED,
                json!({"address": "user@example.com"}),
            ),
            (event_types::EMAIL_VERIFIED, json!({})),
            (
                event_types::UPDATED,
                json!({"data": {"name": "renamed"}}),
            ),
        ];

        let envelopes: Vec<_> = history
            .iter()
            .enumerate()
            .map(|(i, (event_type, payload))| {
                envelope(
                    instance_id,
                    user_id,
                    crate::AGGREGATE_TYPE,
                    i as u64 + 1,
                    event_type,
                    payload.clone(),
                )
            })
            .collect();

        let mut incremental = SchemaUserWriteModel::new(instance_id, user_id);
        for env in &envelopes {
            incremental.reduce([env]).unwrap();
        }

        let mut replayed = SchemaUserWriteModel::new(instance_id, user_id);
        replayed.reduce(envelopes.iter()).unwrap();

        assert_eq!(incremental, replayed);
        assert_eq!(replayed.data(), &json!({"name": "renamed"}));
        assert!(replayed.email_verified());
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let instance_id = InstanceId::new();
        let schema = open_schema(instance_id);
        let mut wm = created_user(instance_id, &schema, json!({"name": "user"}));

        wm.reduce([&envelope(
            instance_id,
            wm.user_id(),
            crate::AGGREGATE_TYPE,
            2,
            "user.something.new",
            json!({"whatever": true}),
        )])
        .unwrap();

        assert!(wm.exists());
        assert_eq!(wm.state().sequence(), 2);
    }
}
