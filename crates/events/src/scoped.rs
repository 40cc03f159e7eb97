use keyforge_core::InstanceId;

use crate::EventEnvelope;

/// Helper trait for instance-scoped messages.
///
/// Marks types that carry an instance ID, so infrastructure components
/// (workers, handlers) can be pinned to one instance and ignore traffic for
/// all others.
pub trait InstanceScoped {
    fn instance_id(&self) -> InstanceId;
}

impl<E> InstanceScoped for EventEnvelope<E> {
    fn instance_id(&self) -> InstanceId {
        self.instance_id()
    }
}
