//! Telemetry boundary: fault reporting and event subscription.
//!
//! The real telemetry pipeline is a collaborator. This module defines the
//! sink trait the subsystems report through, the event-subscription service
//! the trigger manager consumes, and in-process implementations used by
//! single-process hosts and tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ── Fault reporting ─────────────────────────────────────────────────

/// Severity attached to a reported fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultSeverity {
    Diagnostic,
    General,
    Critical,
}

impl fmt::Display for FaultSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultSeverity::Diagnostic => write!(f, "Diagnostic"),
            FaultSeverity::General => write!(f, "General"),
            FaultSeverity::Critical => write!(f, "Critical"),
        }
    }
}

/// Fire-and-forget telemetry sink.
///
/// Subsystem errors are converted to faults at subsystem boundaries rather
/// than propagated into caller code paths.
pub trait TelemetrySink: Send + Sync {
    /// Post a named event with a property bag.
    fn post_event(&self, name: &str, properties: HashMap<String, String>);

    /// Report a fault with enough context to diagnose offline.
    fn post_fault(&self, severity: FaultSeverity, name: &str, description: &str);
}

/// Start a named activity span. Dropping the returned guard ends the
/// activity; telemetry backends that track spans hook `tracing` directly.
pub fn activity(name: &str) -> tracing::span::EnteredSpan {
    tracing::info_span!("activity", activity = name).entered()
}

/// Sink that forwards everything to `tracing` and otherwise drops it.
#[derive(Default)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn post_event(&self, name: &str, properties: HashMap<String, String>) {
        tracing::debug!(event = name, ?properties, "telemetry event");
    }

    fn post_fault(&self, severity: FaultSeverity, name: &str, description: &str) {
        tracing::warn!(%severity, fault = name, description, "telemetry fault");
    }
}

/// Sink that records everything in memory for inspection.
#[derive(Default)]
pub struct MemoryTelemetry {
    faults: Mutex<Vec<(FaultSeverity, String, String)>>,
    events: Mutex<Vec<(String, HashMap<String, String>)>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded faults as `(severity, name, description)` tuples.
    pub fn faults(&self) -> Vec<(FaultSeverity, String, String)> {
        self.faults.lock().expect("telemetry lock poisoned").clone()
    }

    /// Recorded events as `(name, properties)` tuples.
    pub fn events(&self) -> Vec<(String, HashMap<String, String>)> {
        self.events.lock().expect("telemetry lock poisoned").clone()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn post_event(&self, name: &str, properties: HashMap<String, String>) {
        self.events
            .lock()
            .expect("telemetry lock poisoned")
            .push((name.to_string(), properties));
    }

    fn post_fault(&self, severity: FaultSeverity, name: &str, description: &str) {
        tracing::warn!(%severity, fault = name, description, "telemetry fault");
        self.faults.lock().expect("telemetry lock poisoned").push((
            severity,
            name.to_string(),
            description.to_string(),
        ));
    }
}

// ── Event subscription ──────────────────────────────────────────────

/// A posted telemetry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub name: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Declarative match against posted events: name equality plus a property
/// subset the event must carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMatch {
    pub event_name: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl EventMatch {
    pub fn by_name(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            properties: HashMap::new(),
        }
    }

    /// Whether an event satisfies this match.
    pub fn matches(&self, event: &TelemetryEvent) -> bool {
        if event.name != self.event_name {
            return false;
        }
        self.properties
            .iter()
            .all(|(k, v)| event.properties.get(k) == Some(v))
    }
}

/// Identifier handed back by [`EventSubscriptionService::subscribe`].
pub type SubscriptionId = u64;

/// Callback invoked when a subscribed event matches.
pub type EventCallback = Arc<dyn Fn(TelemetryEvent) + Send + Sync>;

/// Subscription side of the telemetry pipeline.
#[async_trait]
pub trait EventSubscriptionService: Send + Sync {
    /// Register a callback for events matching `event_match`.
    ///
    /// With `replay`, events posted before the subscription that match are
    /// delivered immediately.
    async fn subscribe(
        &self,
        event_match: EventMatch,
        replay: bool,
        callback: EventCallback,
    ) -> SubscriptionId;

    /// Remove a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId);
}

/// Blanket implementation so `Arc<dyn EventSubscriptionService>` can be used directly.
#[async_trait]
impl<T: EventSubscriptionService + ?Sized> EventSubscriptionService for Arc<T> {
    async fn subscribe(
        &self,
        event_match: EventMatch,
        replay: bool,
        callback: EventCallback,
    ) -> SubscriptionId {
        (**self).subscribe(event_match, replay, callback).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        (**self).unsubscribe(id).await
    }
}

// ── In-process event bus ────────────────────────────────────────────

struct BusState {
    next_id: SubscriptionId,
    subscriptions: HashMap<SubscriptionId, (EventMatch, EventCallback)>,
    history: Vec<TelemetryEvent>,
}

/// In-process [`EventSubscriptionService`] for single-process hosts and tests.
///
/// Posted events are kept so later subscriptions can replay them.
pub struct LocalEventBus {
    state: Mutex<BusState>,
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                next_id: 1,
                subscriptions: HashMap::new(),
                history: Vec::new(),
            }),
        }
    }

    /// Post an event to every matching subscription.
    ///
    /// Callbacks run inline; consumers needing detached dispatch (the trigger
    /// manager does) spawn their own tasks inside the callback.
    pub fn post(&self, event: TelemetryEvent) {
        let callbacks: Vec<EventCallback> = {
            let mut state = self.state.lock().expect("event bus lock poisoned");
            state.history.push(event.clone());
            state
                .subscriptions
                .values()
                .filter(|(m, _)| m.matches(&event))
                .map(|(_, cb)| cb.clone())
                .collect()
        };
        for cb in callbacks {
            cb(event.clone());
        }
    }
}

#[async_trait]
impl EventSubscriptionService for LocalEventBus {
    async fn subscribe(
        &self,
        event_match: EventMatch,
        replay: bool,
        callback: EventCallback,
    ) -> SubscriptionId {
        let replayed: Vec<TelemetryEvent>;
        let id = {
            let mut state = self.state.lock().expect("event bus lock poisoned");
            let id = state.next_id;
            state.next_id += 1;
            replayed = if replay {
                state
                    .history
                    .iter()
                    .filter(|e| event_match.matches(e))
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            state
                .subscriptions
                .insert(id, (event_match, callback.clone()));
            id
        };
        for event in replayed {
            callback(event);
        }
        id
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.state
            .lock()
            .expect("event bus lock poisoned")
            .subscriptions
            .remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(name: &str, props: &[(&str, &str)]) -> TelemetryEvent {
        TelemetryEvent {
            name: name.to_string(),
            properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn event_match_requires_property_subset() {
        let m = EventMatch {
            event_name: "vs/core/command".to_string(),
            properties: HashMap::from([("commandid".to_string(), "42".to_string())]),
        };
        assert!(m.matches(&event("vs/core/command", &[("commandid", "42"), ("extra", "x")])));
        assert!(!m.matches(&event("vs/core/command", &[("commandid", "7")])));
        assert!(!m.matches(&event("vs/other", &[("commandid", "42")])));
    }

    #[tokio::test]
    async fn bus_dispatches_to_matching_subscriptions() {
        let bus = LocalEventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        bus.subscribe(
            EventMatch::by_name("solution/open"),
            false,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;

        bus.post(event("solution/open", &[]));
        bus.post(event("solution/close", &[]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replay_delivers_past_events_once() {
        let bus = LocalEventBus::new();
        bus.post(event("startup", &[]));

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        bus.subscribe(
            EventMatch::by_name("startup"),
            true,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = LocalEventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = bus
            .subscribe(
                EventMatch::by_name("tick"),
                false,
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        bus.post(event("tick", &[]));
        bus.unsubscribe(id).await;
        bus.post(event("tick", &[]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn memory_telemetry_records_faults() {
        let sink = MemoryTelemetry::new();
        sink.post_fault(FaultSeverity::General, "cache/lock-timeout", "2 rules blocked");
        let faults = sink.faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].0, FaultSeverity::General);
        assert_eq!(faults[0].1, "cache/lock-timeout");
    }
}
