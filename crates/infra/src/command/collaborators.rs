//! Injected collaborators of the command processor.
//!
//! All three are external concerns (policy evaluation, id allocation,
//! code encryption) consumed behind narrow traits so the processor stays
//! deterministic and testable.

use keyforge_core::{AggregateId, DomainResult, InstanceId, OrgId};
use keyforge_users::EncryptedCode;
use uuid::Uuid;

/// Boolean capability check at the command boundary.
///
/// Implementations evaluate policy externally; the processor only cares about
/// allow (Ok) vs deny (`PermissionDenied`).
pub trait PermissionCheck: Send + Sync {
    fn check(
        &self,
        instance_id: InstanceId,
        resource_owner: OrgId,
        permission: &str,
        aggregate_id: AggregateId,
    ) -> DomainResult<()>;
}

/// Collision-resistant identifier source.
pub trait IdGenerator: Send + Sync {
    fn next(&self) -> DomainResult<AggregateId>;
}

/// Default ID source: UUIDv7 (time-ordered).
#[derive(Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next(&self) -> DomainResult<AggregateId> {
        Ok(AggregateId::from_uuid(Uuid::now_v7()))
    }
}

/// Produces verification codes as (encrypted, plaintext) pairs.
///
/// Only the encrypted form is ever persisted; the plaintext is surfaced to
/// the caller when the intent asked for a return code and dropped otherwise.
pub trait EncryptedCodeGenerator: Send + Sync {
    fn generate(&self) -> DomainResult<EncryptedCode>;
}
