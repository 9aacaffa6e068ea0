//! Trigger subscription manager.
//!
//! Actions may declare triggers mapping telemetry-event matches to user
//! callbacks. The `start` trigger is special: it either fires immediately on
//! subscription (`trigger_on_subscribe`) or on its event match, and its
//! first fire is gated through the courtesy engine — a rule that is not
//! currently sendable produces no state change and no user callback. Named
//! triggers only become eligible after `start` has fired. User callbacks
//! always run as detached tasks so a slow consumer cannot stall event
//! delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use beacon_core::{
    EventMatch, EventSubscriptionService, FaultSeverity, SubscriptionId, TelemetrySink,
};

use crate::action::{ActionResponse, TriggerOptions};
use crate::engine::CourtesyEngine;

/// The trigger that gates a rule's lifecycle.
pub const START_TRIGGER: &str = "start";
/// Conventional name for a rule's teardown trigger.
pub const STOP_TRIGGER: &str = "stop";

// ── Validation ──────────────────────────────────────────────────────

/// One validated trigger of an action.
#[derive(Debug, Clone)]
pub struct TriggerSpec {
    pub name: String,
    /// `None` only for a `start` trigger firing on subscription.
    pub event_match: Option<EventMatch>,
    pub options: TriggerOptions,
}

/// Validate an action's trigger wiring.
///
/// Requirements: at least one trigger, a `start` trigger present, every
/// trigger named in both the trigger map and the options map, only `start`
/// may request `trigger_on_subscribe`, and only such a `start` may omit a
/// concrete event match.
pub fn validate_trigger_config(action: &ActionResponse) -> Result<Vec<TriggerSpec>, String> {
    let triggers = action
        .triggers
        .as_ref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| format!("rule '{}' declares no triggers", action.rule_id))?;
    let options = action
        .trigger_options
        .as_ref()
        .ok_or_else(|| format!("rule '{}' declares no trigger options", action.rule_id))?;

    if !triggers.contains_key(START_TRIGGER) {
        return Err(format!("rule '{}' has no '{}' trigger", action.rule_id, START_TRIGGER));
    }
    for name in triggers.keys() {
        if !options.contains_key(name) {
            return Err(format!(
                "rule '{}' trigger '{}' has no matching options entry",
                action.rule_id, name
            ));
        }
    }
    for name in options.keys() {
        if !triggers.contains_key(name) {
            return Err(format!(
                "rule '{}' options entry '{}' has no matching trigger",
                action.rule_id, name
            ));
        }
    }

    let mut specs = Vec::with_capacity(triggers.len());
    for (name, event_match) in triggers {
        let opts = options[name];
        if opts.trigger_on_subscribe && name != START_TRIGGER {
            return Err(format!(
                "rule '{}' trigger '{}' may not use trigger_on_subscribe",
                action.rule_id, name
            ));
        }
        if event_match.is_none() && !(name == START_TRIGGER && opts.trigger_on_subscribe) {
            return Err(format!(
                "rule '{}' trigger '{}' has no event match",
                action.rule_id, name
            ));
        }
        specs.push(TriggerSpec {
            name: name.clone(),
            event_match: event_match.clone(),
            options: opts,
        });
    }

    // Deterministic wiring order, `start` first.
    specs.sort_by_key(|s| (s.name != START_TRIGGER, s.name.clone()));
    Ok(specs)
}

// ── Subscription details ────────────────────────────────────────────

/// Handed to user callbacks; identifies the firing trigger and lets the
/// consumer unsubscribe itself or the whole rule.
#[derive(Clone)]
pub struct TriggerSubscriptionDetails {
    pub rule_id: String,
    pub trigger_name: String,
    /// The rule's typed payload.
    pub action: serde_json::Value,
    manager: TriggerManager,
    subscription: Option<SubscriptionId>,
}

impl TriggerSubscriptionDetails {
    /// Unsubscribe the trigger that fired.
    pub async fn unsubscribe_trigger(&self) {
        if let Some(id) = self.subscription {
            self.manager.unsubscribe_id(&self.rule_id, id).await;
        }
    }

    /// Unsubscribe every trigger of this rule.
    pub async fn unsubscribe_rule(&self) {
        self.manager.unsubscribe_rule(&self.rule_id).await;
    }
}

/// Consumer callback invoked on each trigger fire.
pub type TriggerCallback = Arc<dyn Fn(TriggerSubscriptionDetails) + Send + Sync>;

// ── Manager ─────────────────────────────────────────────────────────

#[derive(Default)]
struct ManagerState {
    /// Rule ids seen by any subscription pass; re-subscription after a
    /// refresh replays only ids not in here, so `start`-on-subscribe cannot
    /// fire twice for the same rule.
    known_rules: std::collections::HashSet<String>,
    /// Live event subscriptions per rule.
    active: HashMap<String, Vec<SubscriptionId>>,
}

struct ManagerInner {
    events: Arc<dyn EventSubscriptionService>,
    engine: Arc<CourtesyEngine>,
    telemetry: Arc<dyn TelemetrySink>,
    state: Mutex<ManagerState>,
}

/// Wires validated actions' triggers to the event-subscription service,
/// gating `start` through the courtesy engine.
#[derive(Clone)]
pub struct TriggerManager {
    inner: Arc<ManagerInner>,
}

/// Per-rule runtime state shared by that rule's trigger callbacks.
struct RuleGate {
    /// Set once `start` has fired (or passed its gate).
    started: AtomicBool,
    /// Serializes trigger callbacks for the rule.
    firing: Mutex<()>,
}

impl TriggerManager {
    pub fn new(
        events: Arc<dyn EventSubscriptionService>,
        engine: Arc<CourtesyEngine>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                events,
                engine,
                telemetry,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    /// Subscribe a batch of actions, skipping rule ids already known from a
    /// prior pass.
    pub async fn subscribe_actions(&self, actions: &[ActionResponse], callback: TriggerCallback) {
        for action in actions {
            self.subscribe_action(action, callback.clone()).await;
        }
    }

    /// Subscribe one action's triggers. Returns `false` when the rule was
    /// already known or its configuration is invalid.
    pub async fn subscribe_action(
        &self,
        action: &ActionResponse,
        callback: TriggerCallback,
    ) -> bool {
        {
            let mut state = self.inner.state.lock().await;
            if !state.known_rules.insert(action.rule_id.clone()) {
                debug!(rule_id = %action.rule_id, "rule already subscribed, skipping replay");
                return false;
            }
        }

        let specs = match validate_trigger_config(action) {
            Ok(specs) => specs,
            Err(message) => {
                warn!(rule_id = %action.rule_id, %message, "invalid trigger configuration");
                self.inner.telemetry.post_fault(
                    FaultSeverity::General,
                    "triggers/invalid-config",
                    &message,
                );
                return false;
            }
        };

        let gate = Arc::new(RuleGate {
            started: AtomicBool::new(false),
            firing: Mutex::new(()),
        });

        for spec in specs {
            if spec.name == START_TRIGGER && spec.options.trigger_on_subscribe {
                // Immediate fire instead of an event subscription; still
                // gated through the courtesy engine.
                self.fire(action.clone(), spec.name, spec.options, gate.clone(), None)
                    .await;
                continue;
            }

            let Some(event_match) = spec.event_match.clone() else {
                continue; // unreachable after validation
            };

            // The subscription learns its own id after registration.
            let slot: Arc<OnceLock<SubscriptionId>> = Arc::new(OnceLock::new());
            let handler = self.event_handler(
                action.clone(),
                spec.name.clone(),
                spec.options,
                gate.clone(),
                slot.clone(),
                callback.clone(),
            );
            let id = self.inner.events.subscribe(event_match, false, handler).await;
            let _ = slot.set(id);

            self.inner
                .state
                .lock()
                .await
                .active
                .entry(action.rule_id.clone())
                .or_default()
                .push(id);
        }

        // The on-subscribe start fire happens before the user callback runs,
        // so dispatch it last, once every trigger is wired.
        if gate.started.load(Ordering::SeqCst) {
            self.dispatch(action, START_TRIGGER, None, callback);
        }
        true
    }

    /// Unsubscribe every trigger of a rule.
    pub async fn unsubscribe_rule(&self, rule_id: &str) {
        let ids = self
            .inner
            .state
            .lock()
            .await
            .active
            .remove(rule_id)
            .unwrap_or_default();
        for id in ids {
            self.inner.events.unsubscribe(id).await;
        }
    }

    /// Unsubscribe everything (disposal path).
    pub async fn unsubscribe_all(&self) {
        let all: Vec<SubscriptionId> = {
            let mut state = self.inner.state.lock().await;
            state.active.drain().flat_map(|(_, ids)| ids).collect()
        };
        for id in all {
            self.inner.events.unsubscribe(id).await;
        }
    }

    async fn unsubscribe_id(&self, rule_id: &str, id: SubscriptionId) {
        {
            let mut state = self.inner.state.lock().await;
            if let Some(ids) = state.active.get_mut(rule_id) {
                ids.retain(|existing| *existing != id);
            }
        }
        self.inner.events.unsubscribe(id).await;
    }

    /// Build the (synchronous) event-bus callback for one trigger. The
    /// actual work runs on a spawned task so event delivery is never
    /// blocked.
    fn event_handler(
        &self,
        action: ActionResponse,
        trigger_name: String,
        options: TriggerOptions,
        gate: Arc<RuleGate>,
        slot: Arc<OnceLock<SubscriptionId>>,
        callback: TriggerCallback,
    ) -> beacon_core::EventCallback {
        let manager = self.clone();
        Arc::new(move |_event| {
            let manager = manager.clone();
            let action = action.clone();
            let trigger_name = trigger_name.clone();
            let gate = gate.clone();
            let slot = slot.clone();
            let callback = callback.clone();
            tokio::spawn(async move {
                let fired = manager
                    .fire(
                        action.clone(),
                        trigger_name.clone(),
                        options,
                        gate,
                        slot.get().copied(),
                    )
                    .await;
                if fired {
                    manager.dispatch(&action, &trigger_name, slot.get().copied(), callback);
                }
            });
        })
    }

    /// Run one trigger invocation under the rule's firing lock. Returns
    /// whether the trigger actually fired (gating may make it a no-op).
    async fn fire(
        &self,
        action: ActionResponse,
        trigger_name: String,
        options: TriggerOptions,
        gate: Arc<RuleGate>,
        subscription: Option<SubscriptionId>,
    ) -> bool {
        let _firing = gate.firing.lock().await;

        if trigger_name == START_TRIGGER {
            if !gate.started.load(Ordering::SeqCst) {
                // First start fire consults the notification cache; a rule
                // that is not sendable right now is a silent no-op.
                let outcome = self
                    .inner
                    .engine
                    .get_sendable_actions_from_set(vec![action.clone()])
                    .await;
                if outcome.sendable.is_empty() {
                    debug!(rule_id = %action.rule_id, "start trigger gated, not firing");
                    return false;
                }
                gate.started.store(true, Ordering::SeqCst);
            }
        } else if !gate.started.load(Ordering::SeqCst) {
            debug!(
                rule_id = %action.rule_id,
                trigger = %trigger_name,
                "trigger before start, ignoring"
            );
            return false;
        }

        if !options.trigger_always {
            if let Some(id) = subscription {
                self.unsubscribe_id(&action.rule_id, id).await;
            }
        }
        true
    }

    /// Invoke the user callback on a detached unit of work.
    fn dispatch(
        &self,
        action: &ActionResponse,
        trigger_name: &str,
        subscription: Option<SubscriptionId>,
        callback: TriggerCallback,
    ) {
        let details = TriggerSubscriptionDetails {
            rule_id: action.rule_id.clone(),
            trigger_name: trigger_name.to_string(),
            action: action.action.clone(),
            manager: self.clone(),
            subscription,
        };
        tokio::spawn(async move {
            callback(details);
        });
    }
}
