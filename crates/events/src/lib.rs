//! In-process event bus for workflow and domain lifecycle events.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod lifecycle;

pub use bus::{EmittedEvent, EventBus, EventBusError, EventHandler, Subscription};
pub use event::{names, DomainEvent, EventBusExt};
pub use in_memory_bus::InMemoryEventBus;
pub use lifecycle::{WorkflowCompleted, WorkflowFailed};
