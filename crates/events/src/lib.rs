//! `keyforge-events` — event mechanics shared by the write and read sides.
//!
//! No storage assumptions live here: persistence is `keyforge-infra`'s job.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod scoped;
pub mod write_model;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::InMemoryEventBus;
pub use scoped::InstanceScoped;
pub use write_model::{WriteModel, WriteModelState};
