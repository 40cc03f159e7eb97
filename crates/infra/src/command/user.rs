//! Schema-user commands: create, change, delete.

use serde_json::Value as JsonValue;

use keyforge_core::{AggregateId, DomainError, DomainResult, OrgId};
use keyforge_events::WriteModel;
use keyforge_schemas::{FieldRole, UserSchemaWriteModel};
use keyforge_users::{Email, Phone, SchemaUserWriteModel};

use super::{CommandContext, CommandError, Commands, ObjectDetails, permissions};
use crate::event_store::EventStore;

/// Intent: create a schema user.
#[derive(Debug, Clone)]
pub struct CreateSchemaUser {
    pub resource_owner: OrgId,
    /// Generated via the injected ID source when absent.
    pub user_id: Option<AggregateId>,
    pub schema_id: AggregateId,
    pub data: JsonValue,
    pub email: Option<Email>,
    pub phone: Option<Phone>,
}

impl CreateSchemaUser {
    /// Structural validation; normalizes the phone number in place.
    pub fn valid(&mut self) -> DomainResult<()> {
        if let Some(email) = &self.email {
            email.validate()?;
        }
        if let Some(phone) = &mut self.phone {
            phone.number = phone.normalized()?;
        }
        Ok(())
    }
}

/// Requested schema/data change for an existing user.
#[derive(Debug, Clone)]
pub struct SchemaUpdate {
    /// Keep the user's current schema when absent.
    pub schema_id: Option<AggregateId>,
    pub data: Option<JsonValue>,
}

/// Intent: change a schema user.
#[derive(Debug, Clone)]
pub struct ChangeSchemaUser {
    pub resource_owner: OrgId,
    pub user_id: AggregateId,
    pub schema_user: Option<SchemaUpdate>,
    pub email: Option<Email>,
    pub phone: Option<Phone>,
}

impl ChangeSchemaUser {
    /// Structural validation; normalizes the phone number in place.
    pub fn valid(&mut self) -> DomainResult<()> {
        if let Some(email) = &self.email {
            email.validate()?;
        }
        if let Some(phone) = &mut self.phone {
            phone.number = phone.normalized()?;
        }
        Ok(())
    }
}

/// Result of a user create/change: the consistency token plus any plaintext
/// verification codes the intent asked to have returned.
#[derive(Debug, Clone)]
pub struct SchemaUserResult {
    pub details: ObjectDetails,
    pub email_code: Option<String>,
    pub phone_code: Option<String>,
}

impl<S> Commands<S>
where
    S: EventStore,
{
    pub fn create_schema_user(
        &self,
        ctx: &CommandContext,
        mut user: CreateSchemaUser,
    ) -> Result<SchemaUserResult, CommandError> {
        user.valid()?;

        let user_id = match user.user_id {
            Some(id) => id,
            None => self.id_generator().next()?,
        };
        let role = role_for(ctx, user_id);

        self.with_retry(|| {
            let mut wm = SchemaUserWriteModel::new(ctx.instance_id, user_id);
            self.load_write_model(&mut wm)?;

            let schema = self.existing_schema(ctx, user.schema_id)?;

            self.check_permission(ctx, user.resource_owner, permissions::USER_WRITE, user_id)?;

            let code_generator = self.code_generator();
            let (events, email_code, phone_code) = wm.new_create(
                &schema,
                user.data.clone(),
                user.email.as_ref(),
                user.phone.as_ref(),
                role,
                || code_generator.generate(),
            )?;

            let committed = self.push(ctx, &wm, user.resource_owner, &events)?;
            Ok(SchemaUserResult {
                details: self.details_for(&wm, user.resource_owner, &committed),
                email_code,
                phone_code,
            })
        })
    }

    pub fn change_schema_user(
        &self,
        ctx: &CommandContext,
        mut user: ChangeSchemaUser,
    ) -> Result<SchemaUserResult, CommandError> {
        user.valid()?;

        let role = role_for(ctx, user.user_id);

        self.with_retry(|| {
            let mut wm = SchemaUserWriteModel::new(ctx.instance_id, user.user_id);
            self.load_write_model(&mut wm)?;
            if !wm.exists() {
                return Err(DomainError::not_found().into());
            }

            // Validate against the newly referenced schema, or the user's
            // current one when only the data changes.
            let schema = match &user.schema_user {
                Some(update) => {
                    let schema_id = update
                        .schema_id
                        .or_else(|| wm.schema_id())
                        .ok_or(DomainError::NotFound)?;
                    Some(self.existing_schema(ctx, schema_id)?)
                }
                None => None,
            };

            self.check_permission(ctx, user.resource_owner, permissions::USER_WRITE, user.user_id)?;

            let data = user.schema_user.as_ref().and_then(|u| u.data.clone());
            let code_generator = self.code_generator();
            let (events, email_code, phone_code) = wm.new_update(
                schema.as_ref(),
                data,
                user.email.as_ref(),
                user.phone.as_ref(),
                role,
                || code_generator.generate(),
            )?;

            let committed = self.push(ctx, &wm, user.resource_owner, &events)?;
            Ok(SchemaUserResult {
                details: self.details_for(&wm, user.resource_owner, &committed),
                email_code,
                phone_code,
            })
        })
    }

    pub fn delete_schema_user(
        &self,
        ctx: &CommandContext,
        resource_owner: OrgId,
        user_id: AggregateId,
    ) -> Result<ObjectDetails, CommandError> {
        self.with_retry(|| {
            let mut wm = SchemaUserWriteModel::new(ctx.instance_id, user_id);
            self.load_write_model(&mut wm)?;

            self.check_permission(ctx, resource_owner, permissions::USER_DELETE, user_id)?;

            let events = wm.new_delete()?;
            let committed = self.push(ctx, &wm, resource_owner, &events)?;
            Ok(self.details_for(&wm, resource_owner, &committed))
        })
    }

    /// Load a schema write model and require its existence.
    fn existing_schema(
        &self,
        ctx: &CommandContext,
        schema_id: AggregateId,
    ) -> Result<UserSchemaWriteModel, CommandError> {
        let mut schema = UserSchemaWriteModel::new(ctx.instance_id, schema_id);
        self.load_write_model(&mut schema)?;
        if !schema.exists() {
            return Err(DomainError::not_found().into());
        }
        Ok(schema)
    }
}

/// A user editing their own record acts in the `self` role; anyone else is
/// an owner.
fn role_for(ctx: &CommandContext, user_id: AggregateId) -> FieldRole {
    if ctx.actor.as_uuid() == user_id.as_uuid() {
        FieldRole::Self_
    } else {
        FieldRole::Owner
    }
}
