//! In-memory event bus.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, mpsc};

use chrono::Utc;
use serde_json::{Map, Value as JsonValue};
use tracing::{info, warn};

use crate::bus::{EmittedEvent, EventBus, EventBusError, EventHandler, Subscription};

/// Subscribes to every event name.
pub const WILDCARD: &str = "*";

enum Sink {
    Callback {
        event: String,
        handler: Arc<dyn Fn(&EmittedEvent) + Send + Sync>,
    },
    Channel(mpsc::Sender<EmittedEvent>),
}

struct Subscriber {
    id: u64,
    sink: Sink,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// In-process pub/sub bus.
///
/// - No IO / no async
/// - Synchronous fan-out in subscription order
/// - A panicking callback is logged and skipped; later subscribers still run
/// - Every emission is mirrored to `tracing` under `workflowq::events`
#[derive(Default)]
pub struct InMemoryEventBus {
    registry: Mutex<Registry>,
}

impl core::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .map(|r| r.subscribers.len())
            .unwrap_or(0)
    }

    /// Drop every subscriber. Channel subscriptions observe `Disconnected`.
    pub fn shutdown(&self) {
        if let Ok(mut registry) = self.registry.lock() {
            let dropped = registry.subscribers.len();
            registry.subscribers.clear();
            info!(target: "workflowq::events", dropped, "event bus shut down");
        }
    }

    fn register(&self, sink: Sink) -> Result<(), EventBusError> {
        let mut registry = self.registry.lock().map_err(|_| EventBusError::Poisoned)?;
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.push(Subscriber { id, sink });
        Ok(())
    }
}

/// Merge `timestamp` into the payload; non-object payloads are wrapped under `data`.
fn enrich(payload: JsonValue, timestamp: &str) -> JsonValue {
    let mut map = match payload {
        JsonValue::Object(map) => map,
        JsonValue::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    map.insert(
        "timestamp".to_string(),
        JsonValue::String(timestamp.to_string()),
    );
    JsonValue::Object(map)
}

enum Target {
    Callback(Arc<dyn Fn(&EmittedEvent) + Send + Sync>),
    Channel(u64, mpsc::Sender<EmittedEvent>),
}

impl EventBus for InMemoryEventBus {
    fn emit(&self, name: &str, payload: JsonValue) -> Result<EmittedEvent, EventBusError> {
        let timestamp = Utc::now();
        let event = EmittedEvent {
            name: name.to_string(),
            payload: enrich(payload, &timestamp.to_rfc3339()),
            timestamp,
        };

        info!(
            target: "workflowq::events",
            event = %event.name,
            payload = %event.payload,
            "event emitted"
        );

        // Snapshot under the lock, deliver outside it so subscribers may emit or subscribe.
        let targets: Vec<Target> = {
            let registry = self.registry.lock().map_err(|_| EventBusError::Poisoned)?;
            registry
                .subscribers
                .iter()
                .filter_map(|s| match &s.sink {
                    Sink::Callback { event, handler } if event == name || event == WILDCARD => {
                        Some(Target::Callback(handler.clone()))
                    }
                    Sink::Callback { .. } => None,
                    Sink::Channel(tx) => Some(Target::Channel(s.id, tx.clone())),
                })
                .collect()
        };

        let mut dead = Vec::new();
        for target in targets {
            match target {
                Target::Callback(handler) => {
                    if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                        warn!(
                            target: "workflowq::events",
                            event = %event.name,
                            "event subscriber panicked"
                        );
                    }
                }
                Target::Channel(id, tx) => {
                    if tx.send(event.clone()).is_err() {
                        dead.push(id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut registry = self.registry.lock().map_err(|_| EventBusError::Poisoned)?;
            registry.subscribers.retain(|s| !dead.contains(&s.id));
        }

        Ok(event)
    }

    fn on(&self, name: &str, handler: EventHandler) -> Result<(), EventBusError> {
        self.register(Sink::Callback {
            event: name.to_string(),
            handler: Arc::from(handler),
        })
    }

    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned we still hand out a subscription;
        // it just never receives anything.
        if self.register(Sink::Channel(tx)).is_err() {
            warn!(target: "workflowq::events", "subscribe on poisoned event bus");
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::json;

    use super::*;

    fn recorder(bus: &InMemoryEventBus, name: &str, tag: &'static str, log: Arc<StdMutex<Vec<String>>>) {
        bus.on(
            name,
            Box::new(move |e: &EmittedEvent| {
                log.lock().unwrap().push(format!("{tag}:{}", e.name));
            }),
        )
        .unwrap();
    }

    #[test]
    fn delivers_in_subscription_order() {
        let bus = InMemoryEventBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        recorder(&bus, "deal.created", "first", log.clone());
        recorder(&bus, WILDCARD, "second", log.clone());
        recorder(&bus, "deal.created", "third", log.clone());

        bus.emit("deal.created", json!({"dealId": "d-1"})).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "first:deal.created".to_string(),
                "second:deal.created".to_string(),
                "third:deal.created".to_string(),
            ]
        );
    }

    #[test]
    fn only_matching_names_are_delivered() {
        let bus = InMemoryEventBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        recorder(&bus, "renewal.due", "renewals", log.clone());

        bus.emit("payment.completed", json!({})).unwrap();
        assert!(log.lock().unwrap().is_empty());

        bus.emit("renewal.due", json!({})).unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn emission_is_stamped_with_timestamp() {
        let bus = InMemoryEventBus::new();
        let event = bus
            .emit("service.purchased", json!({"serviceId": "s-9"}))
            .unwrap();

        assert_eq!(event.payload["serviceId"], "s-9");
        assert_eq!(
            event.payload["timestamp"],
            JsonValue::String(event.timestamp.to_rfc3339())
        );
    }

    #[test]
    fn non_object_payloads_are_wrapped() {
        let bus = InMemoryEventBus::new();
        let event = bus.emit("renewal.due", json!(42)).unwrap();
        assert_eq!(event.payload["data"], 42);
        assert!(event.payload.get("timestamp").is_some());
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let bus = InMemoryEventBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        bus.on("workflow.failed", Box::new(|_| panic!("subscriber bug")))
            .unwrap();
        recorder(&bus, "workflow.failed", "after", log.clone());

        bus.emit("workflow.failed", json!({})).unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn channel_subscription_receives_everything() {
        let bus = InMemoryEventBus::new();
        let sub = bus.subscribe();

        bus.emit("payment.completed", json!({"amount": 100})).unwrap();
        bus.emit("deal.created", json!({})).unwrap();

        let names: Vec<String> = sub.drain().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["payment.completed", "deal.created"]);
    }

    #[test]
    fn dropped_channel_subscriptions_are_pruned() {
        let bus = InMemoryEventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        bus.emit("deal.created", json!({})).unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn shutdown_disconnects_subscriptions() {
        let bus = InMemoryEventBus::new();
        let sub = bus.subscribe();
        bus.shutdown();

        assert!(matches!(
            sub.recv(),
            Err(std::sync::mpsc::RecvError)
        ));
    }

    #[test]
    fn subscribers_may_emit_reentrantly() {
        let bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();

        let inner = bus.clone();
        bus.on(
            "payment.completed",
            Box::new(move |_| {
                inner.emit("service.purchased", json!({})).unwrap();
            }),
        )
        .unwrap();

        bus.emit("payment.completed", json!({})).unwrap();

        let names: Vec<String> = sub.drain().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["payment.completed", "service.purchased"]);
    }
}
