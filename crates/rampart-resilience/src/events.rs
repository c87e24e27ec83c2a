//! ---
//! rampart_section: "02-resilience-core"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "In-process observer contract shared by all components."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{ReentrantMutex, RwLock};
use serde::Serialize;
use tracing::warn;

/// Event types emitted by the resilience components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    CircuitOpened,
    CircuitClosed,
    CircuitHalfOpen,
    CircuitRejected,
    CircuitReset,
    HealthCheckCompleted,
    HealthThresholdCrossed,
    FailureDetected,
    RecoveryStarted,
    RecoveryCompleted,
    EscalationTriggered,
    DegradationLevelChanged,
    ExperimentStarted,
    ExperimentCompleted,
}

impl EventKind {
    /// Stable label matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CircuitOpened => "circuit-opened",
            EventKind::CircuitClosed => "circuit-closed",
            EventKind::CircuitHalfOpen => "circuit-half-open",
            EventKind::CircuitRejected => "circuit-rejected",
            EventKind::CircuitReset => "circuit-reset",
            EventKind::HealthCheckCompleted => "health-check-completed",
            EventKind::HealthThresholdCrossed => "health-threshold-crossed",
            EventKind::FailureDetected => "failure-detected",
            EventKind::RecoveryStarted => "recovery-started",
            EventKind::RecoveryCompleted => "recovery-completed",
            EventKind::EscalationTriggered => "escalation-triggered",
            EventKind::DegradationLevelChanged => "degradation-level-changed",
            EventKind::ExperimentStarted => "experiment-started",
            EventKind::ExperimentCompleted => "experiment-completed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload delivered to listeners.
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl ResilienceEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            component: None,
            timestamp: Utc::now(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Type-erased listener callback.
pub type EventListener = Arc<dyn Fn(&ResilienceEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered listener registry with per-listener panic isolation.
///
/// Delivery walks a snapshot of the registry, so listeners may subscribe or
/// unsubscribe while an event is being delivered. Deliveries are serialised:
/// a listener never observes two events concurrently.
pub struct EventBus {
    source: &'static str,
    listeners: RwLock<Vec<(ListenerId, EventListener)>>,
    next_id: AtomicU64,
    delivery: ReentrantMutex<()>,
}

impl EventBus {
    /// Create an empty bus; `source` labels log lines about misbehaving listeners.
    pub fn new(source: &'static str) -> Self {
        Self {
            source,
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            delivery: ReentrantMutex::new(()),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ResilienceEvent) + Send + Sync + 'static,
    {
        self.subscribe_arc(Arc::new(listener))
    }

    pub fn subscribe_arc(&self, listener: EventListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Remove a listener; returns `false` when the id is unknown.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `event` to every listener in registration order.
    pub fn emit(&self, event: &ResilienceEvent) {
        let snapshot: Vec<(ListenerId, EventListener)> = self.listeners.read().clone();
        if snapshot.is_empty() {
            return;
        }
        let _delivery = self.delivery.lock();
        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(
                    target: "rampart::resilience::events",
                    source = self.source,
                    listener = id.0,
                    event = %event.kind,
                    "event listener panicked; continuing delivery",
                );
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("source", &self.source)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = EventBus::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.subscribe(move |_| seen.lock().push(label));
        }
        bus.emit(&ResilienceEvent::new(EventKind::CircuitOpened));
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let bus = EventBus::new("test");
        let delivered = Arc::new(Mutex::new(0usize));
        bus.subscribe(|_| panic!("listener bug"));
        let counter = delivered.clone();
        bus.subscribe(move |_| *counter.lock() += 1);
        bus.emit(&ResilienceEvent::new(EventKind::CircuitClosed));
        bus.emit(&ResilienceEvent::new(EventKind::CircuitClosed));
        assert_eq!(*delivered.lock(), 2);
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let bus = EventBus::new("test");
        let hits = Arc::new(Mutex::new(0usize));
        let counter = hits.clone();
        let id = bus.subscribe(move |_| *counter.lock() += 1);
        bus.emit(&ResilienceEvent::new(EventKind::FailureDetected));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&ResilienceEvent::new(EventKind::FailureDetected));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn listener_may_subscribe_during_delivery() {
        let bus = Arc::new(EventBus::new("test"));
        let inner = bus.clone();
        bus.subscribe(move |_| {
            inner.subscribe(|_| {});
        });
        bus.emit(&ResilienceEvent::new(EventKind::CircuitReset));
        assert_eq!(bus.listener_count(), 2);
    }

    #[test]
    fn event_serializes_type_field() {
        let event = ResilienceEvent::new(EventKind::CircuitHalfOpen).with_component("svc");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "circuit-half-open");
        assert_eq!(json["component"], "svc");
        assert!(json.get("details").is_none());
    }
}
