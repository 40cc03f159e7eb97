//! Limits commands: set and reset per-resource-owner limits.
//!
//! The limits aggregate is a singleton per (instance, resource owner): its
//! aggregate ID is discovered by filtering rather than supplied by the
//! caller, and allocated on first use.

use std::time::Duration;

use keyforge_core::OrgId;
use keyforge_events::WriteModel;
use keyforge_limits::LimitsWriteModel;

use super::{CommandContext, CommandError, Commands, ObjectDetails, permissions};
use crate::event_store::{EventStore, SearchQuery};

/// Intent: set limits for a resource owner.
#[derive(Debug, Clone)]
pub struct SetLimits {
    pub resource_owner: OrgId,
    pub audit_log_retention: Option<Duration>,
}

impl<S> Commands<S>
where
    S: EventStore,
{
    pub fn set_limits(
        &self,
        ctx: &CommandContext,
        limits: SetLimits,
    ) -> Result<ObjectDetails, CommandError> {
        self.with_retry(|| {
            let wm = self.load_limits(ctx, limits.resource_owner)?;

            self.check_permission(
                ctx,
                limits.resource_owner,
                permissions::LIMITS_WRITE,
                wm.state().aggregate_id(),
            )?;

            let events = wm.new_set(limits.audit_log_retention)?;
            let committed = self.push(ctx, &wm, limits.resource_owner, &events)?;
            Ok(self.details_for(&wm, limits.resource_owner, &committed))
        })
    }

    pub fn reset_limits(
        &self,
        ctx: &CommandContext,
        resource_owner: OrgId,
    ) -> Result<ObjectDetails, CommandError> {
        self.with_retry(|| {
            let wm = self.load_limits(ctx, resource_owner)?;

            self.check_permission(
                ctx,
                resource_owner,
                permissions::LIMITS_WRITE,
                wm.state().aggregate_id(),
            )?;

            let events = wm.new_reset()?;
            let committed = self.push(ctx, &wm, resource_owner, &events)?;
            Ok(self.details_for(&wm, resource_owner, &committed))
        })
    }

    /// Load the limits singleton for a resource owner.
    ///
    /// The aggregate ID comes from the stream's first event when one exists;
    /// a fresh ID is allocated otherwise (the guard `Exact(0)` then protects
    /// against two concurrent first writers).
    fn load_limits(
        &self,
        ctx: &CommandContext,
        resource_owner: OrgId,
    ) -> Result<LimitsWriteModel, CommandError> {
        let page = self.store.filter(
            &SearchQuery::for_instance(ctx.instance_id)
                .with_aggregate_type(keyforge_limits::AGGREGATE_TYPE)
                .with_resource_owner(resource_owner)
                .with_limit(1),
        )?;

        let aggregate_id = match page.events.first() {
            Some(event) => event.aggregate_id,
            None => self.id_generator().next()?,
        };

        let mut wm = LimitsWriteModel::new(ctx.instance_id, aggregate_id);
        self.load_write_model(&mut wm)?;
        Ok(wm)
    }
}
