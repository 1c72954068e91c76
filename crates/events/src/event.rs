use serde::Serialize;

use crate::bus::{EmittedEvent, EventBus, EventBusError};

/// Canonical event names.
pub mod names {
    pub const PAYMENT_COMPLETED: &str = "payment.completed";
    pub const SERVICE_PURCHASED: &str = "service.purchased";
    pub const DEAL_CREATED: &str = "deal.created";
    pub const RENEWAL_DUE: &str = "renewal.due";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
}

/// A typed event with a stable name (e.g. "workflow.completed").
///
/// Events are facts: immutable once emitted. The serialized form is the
/// payload handed to subscribers.
pub trait DomainEvent: Serialize + core::fmt::Debug + Send + Sync {
    const NAME: &'static str;
}

/// Typed emission on top of any [`EventBus`].
pub trait EventBusExt: EventBus {
    fn publish<E: DomainEvent>(&self, event: &E) -> Result<EmittedEvent, EventBusError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventBusError::Serialize(format!("{}: {e}", E::NAME)))?;
        self.emit(E::NAME, payload)
    }
}

impl<B: EventBus + ?Sized> EventBusExt for B {}
