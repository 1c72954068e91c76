//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern**: a publish/subscribe channel
//! that broadcasts named lifecycle events (`workflow.completed`,
//! `payment.completed`, ...) to any number of consumers.
//!
//! ## Delivery Semantics
//!
//! - **Synchronous**: `emit()` returns after every current subscriber has seen the event
//! - **Ordered**: subscribers are invoked in the order they subscribed
//! - **Enriched**: the bus stamps every emission with a `timestamp`
//! - **No persistence**: the Job Store is the source of truth; the bus only distributes
//!
//! ## Lifecycle
//!
//! A bus is constructed once at process start and handed to the dispatcher
//! and to every subscriber explicitly. There is no global instance.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// An event as delivered to subscribers.
///
/// `payload` carries the event-specific fields plus the added `timestamp`
/// field (RFC 3339), mirroring `timestamp` below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedEvent {
    pub name: String,
    pub payload: JsonValue,
    pub timestamp: DateTime<Utc>,
}

/// Callback subscriber.
pub type EventHandler = Box<dyn Fn(&EmittedEvent) + Send + Sync>;

/// Event bus error.
#[derive(Debug, Clone, Error)]
pub enum EventBusError {
    /// Internal lock poisoning.
    #[error("event bus lock poisoned")]
    Poisoned,

    /// A typed event could not be serialized into a payload.
    #[error("failed to serialize event payload: {0}")]
    Serialize(String),
}

/// A channel subscription to every event on the bus.
///
/// Useful for consumers living on another thread (dashboards, alerting).
/// Each subscription gets a copy of all emitted events (broadcast semantics).
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe();
///
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => process(event)?,
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,  // Check for shutdown
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,  // Bus shut down
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription {
    receiver: Receiver<EmittedEvent>,
}

impl Subscription {
    pub fn new(receiver: Receiver<EmittedEvent>) -> Self {
        Self { receiver }
    }

    /// Block until the next event is available.
    pub fn recv(&self) -> Result<EmittedEvent, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&self) -> Result<EmittedEvent, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for an event.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<EmittedEvent, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<EmittedEvent> {
        self.receiver.try_iter().collect()
    }
}

/// Named-event bus (pub/sub abstraction).
///
/// ## Thread Safety
///
/// The trait requires `Send + Sync`; the dispatcher emits from many job tasks
/// concurrently. Subscribers must therefore be `Send + Sync` as well.
pub trait EventBus: Send + Sync {
    /// Stamp `payload` with a timestamp and deliver it to all current subscribers.
    fn emit(&self, name: &str, payload: JsonValue) -> Result<EmittedEvent, EventBusError>;

    /// Register a callback for `name`, or for every event with `"*"`.
    fn on(&self, name: &str, handler: EventHandler) -> Result<(), EventBusError>;

    /// Open a channel subscription receiving every event.
    fn subscribe(&self) -> Subscription;
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    fn emit(&self, name: &str, payload: JsonValue) -> Result<EmittedEvent, EventBusError> {
        (**self).emit(name, payload)
    }

    fn on(&self, name: &str, handler: EventHandler) -> Result<(), EventBusError> {
        (**self).on(name, handler)
    }

    fn subscribe(&self) -> Subscription {
        (**self).subscribe()
    }
}
