//! User-schema commands: create, update, (de/re)activate, delete.

use serde_json::Value as JsonValue;

use keyforge_core::{AggregateId, OrgId};
use keyforge_schemas::UserSchemaWriteModel;

use super::{CommandContext, CommandError, Commands, ObjectDetails, permissions};
use crate::event_store::EventStore;

/// Intent: create a user schema.
#[derive(Debug, Clone)]
pub struct CreateUserSchema {
    pub resource_owner: OrgId,
    /// Generated via the injected ID source when absent.
    pub schema_id: Option<AggregateId>,
    pub schema_type: String,
    pub document: JsonValue,
}

/// Intent: update a user schema.
#[derive(Debug, Clone)]
pub struct UpdateUserSchema {
    pub resource_owner: OrgId,
    pub schema_id: AggregateId,
    pub schema_type: Option<String>,
    pub document: Option<JsonValue>,
}

impl<S> Commands<S>
where
    S: EventStore,
{
    pub fn create_user_schema(
        &self,
        ctx: &CommandContext,
        schema: CreateUserSchema,
    ) -> Result<ObjectDetails, CommandError> {
        let schema_id = match schema.schema_id {
            Some(id) => id,
            None => self.id_generator().next()?,
        };

        self.with_retry(|| {
            let mut wm = UserSchemaWriteModel::new(ctx.instance_id, schema_id);
            self.load_write_model(&mut wm)?;

            self.check_permission(
                ctx,
                schema.resource_owner,
                permissions::USER_SCHEMA_WRITE,
                schema_id,
            )?;

            let events = wm.new_create(&schema.schema_type, schema.document.clone())?;
            let committed = self.push(ctx, &wm, schema.resource_owner, &events)?;
            Ok(self.details_for(&wm, schema.resource_owner, &committed))
        })
    }

    pub fn update_user_schema(
        &self,
        ctx: &CommandContext,
        schema: UpdateUserSchema,
    ) -> Result<ObjectDetails, CommandError> {
        self.with_retry(|| {
            let mut wm = UserSchemaWriteModel::new(ctx.instance_id, schema.schema_id);
            self.load_write_model(&mut wm)?;

            self.check_permission(
                ctx,
                schema.resource_owner,
                permissions::USER_SCHEMA_WRITE,
                schema.schema_id,
            )?;

            let events =
                wm.new_update(schema.schema_type.as_deref(), schema.document.clone())?;
            let committed = self.push(ctx, &wm, schema.resource_owner, &events)?;
            Ok(self.details_for(&wm, schema.resource_owner, &committed))
        })
    }

    pub fn deactivate_user_schema(
        &self,
        ctx: &CommandContext,
        resource_owner: OrgId,
        schema_id: AggregateId,
    ) -> Result<ObjectDetails, CommandError> {
        self.schema_transition(ctx, resource_owner, schema_id, UserSchemaWriteModel::new_deactivate)
    }

    pub fn reactivate_user_schema(
        &self,
        ctx: &CommandContext,
        resource_owner: OrgId,
        schema_id: AggregateId,
    ) -> Result<ObjectDetails, CommandError> {
        self.schema_transition(ctx, resource_owner, schema_id, UserSchemaWriteModel::new_reactivate)
    }

    pub fn delete_user_schema(
        &self,
        ctx: &CommandContext,
        resource_owner: OrgId,
        schema_id: AggregateId,
    ) -> Result<ObjectDetails, CommandError> {
        self.schema_transition(ctx, resource_owner, schema_id, UserSchemaWriteModel::new_delete)
    }

    fn schema_transition(
        &self,
        ctx: &CommandContext,
        resource_owner: OrgId,
        schema_id: AggregateId,
        transition: fn(&UserSchemaWriteModel) -> keyforge_core::DomainResult<Vec<keyforge_schemas::UserSchemaEvent>>,
    ) -> Result<ObjectDetails, CommandError> {
        self.with_retry(|| {
            let mut wm = UserSchemaWriteModel::new(ctx.instance_id, schema_id);
            self.load_write_model(&mut wm)?;

            self.check_permission(ctx, resource_owner, permissions::USER_SCHEMA_WRITE, schema_id)?;

            let events = transition(&wm)?;
            let committed = self.push(ctx, &wm, resource_owner, &events)?;
            Ok(self.details_for(&wm, resource_owner, &committed))
        })
    }
}
