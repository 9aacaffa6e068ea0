//! Courtesy engine: decides which actions are sendable right now.
//!
//! Send-once rules are tracked in the cross-process cache until consumed or
//! expired; courtesy categories impose cooldown windows across all rules
//! sharing them. Every decision runs under the cache lock so two processes
//! on the machine cannot double-send. When the lock cannot be acquired (or
//! anything fails mid-operation) the engine degrades conservatively: only
//! `send_always` actions without categories pass, and a fault is reported
//! instead of an error propagating into the caller.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use beacon_core::{BeaconError, FaultSeverity, TelemetrySink};

use crate::action::ActionResponse;
use crate::cache::{CachedActionCategoryTime, CachedActionResponseTime};
use crate::repository::CacheRepository;

/// Pending window for send-once rules that do not declare their own.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(14 * 24 * 3_600);

// ── Clock injection ─────────────────────────────────────────────────

/// Time source, injectable so courtesy windows are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += chrono::Duration::from_std(by).expect("advance within range");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

/// Result of a sendability decision.
///
/// Degradation is a value, not an exception: on lock timeout or cache
/// failure `sendable` holds the conservative subset and `fault` describes
/// what was blocked.
#[derive(Debug, Default)]
pub struct SendOutcome {
    /// Actions cleared for delivery, in candidate order.
    pub sendable: Vec<ActionResponse>,
    /// Rule ids withheld this round.
    pub blocked: Vec<String>,
    /// Present when the decision degraded or hit a configuration fault.
    pub fault: Option<String>,
}

// ── Engine ──────────────────────────────────────────────────────────

pub struct CourtesyEngine {
    repository: CacheRepository,
    telemetry: Arc<dyn TelemetrySink>,
    /// Configured cooldown per category; an action declaring a category
    /// absent from this map can never be sent.
    category_waits: HashMap<String, Duration>,
    clock: Arc<dyn Clock>,
    lock_timeout: Option<Duration>,
}

impl CourtesyEngine {
    pub fn new(repository: CacheRepository, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            repository,
            telemetry,
            category_waits: HashMap::new(),
            clock: Arc::new(SystemClock),
            lock_timeout: None,
        }
    }

    pub fn with_category_waits(mut self, waits: HashMap<String, Duration>) -> Self {
        self.category_waits = waits;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound the wait for the cache lock. Default is unbounded.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Merge freshly fetched actions against the cached state.
    ///
    /// `known_cached_rule_ids` is what the caller already saw in the cache
    /// from its previous refresh; those entries are left as they are so a
    /// rule consumed in the meantime is not resurrected.
    pub async fn merge_new_response(
        &self,
        new_actions: &[ActionResponse],
        known_cached_rule_ids: &HashSet<String>,
    ) -> Result<(), BeaconError> {
        let now = self.clock.now();
        let actions: Vec<(String, bool, Option<Duration>)> = new_actions
            .iter()
            .map(|a| (a.rule_id.clone(), a.send_always, a.max_wait_duration()))
            .collect();
        let known = known_cached_rule_ids.clone();
        let waits = self.category_waits.clone();

        let result = self
            .repository
            .with_lock("merge_new_response", self.lock_timeout, move |cache| {
                for (rule_id, send_always, max_wait) in actions {
                    if send_always {
                        // Never gated; drop any stale entry.
                        cache.actions.remove(&rule_id);
                    } else if !known.contains(&rule_id) {
                        let max_wait = max_wait.unwrap_or(DEFAULT_MAX_WAIT);
                        cache
                            .actions
                            .entry(rule_id)
                            .and_modify(|entry| entry.max_wait = max_wait)
                            .or_insert(CachedActionResponseTime {
                                cached_time: now,
                                max_wait,
                            });
                    }
                }

                cache.actions.retain(|_, entry| !entry.is_expired(now));

                for (category, wait) in &waits {
                    if let Some(entry) = cache.categories.get_mut(category) {
                        if entry.wait != *wait {
                            entry.wait = *wait;
                        }
                    }
                }
                cache.categories.retain(|_, entry| !entry.is_expired(now));
            })
            .await;

        if let Err(e) = &result {
            self.report_degradation("merge_new_response", e, &[]);
        }
        result
    }

    /// Decide which of the (already scope-filtered) candidates may be sent
    /// right now, recording the consumption and cooldown side effects.
    pub async fn get_sendable_actions_from_set(
        &self,
        candidates: Vec<ActionResponse>,
    ) -> SendOutcome {
        let now = self.clock.now();
        let waits = self.category_waits.clone();
        let to_decide = candidates.clone();

        let result = self
            .repository
            .with_lock(
                "get_sendable_actions_from_set",
                self.lock_timeout,
                move |cache| {
                    let mut sendable = Vec::new();
                    let mut blocked = Vec::new();
                    let mut unknown_categories = Vec::new();

                    for action in to_decide {
                        // Every declared category must have configured
                        // wait-time metadata.
                        if let Some(category) = action
                            .categories
                            .iter()
                            .find(|c| !waits.contains_key(c.as_str()))
                        {
                            unknown_categories
                                .push((action.rule_id.clone(), category.clone()));
                            blocked.push(action.rule_id);
                            continue;
                        }

                        // Send-once rules must still be pending in the cache.
                        if !action.send_always && !cache.actions.contains_key(&action.rule_id)
                        {
                            blocked.push(action.rule_id);
                            continue;
                        }

                        // No declared category may be inside its cooldown.
                        if action
                            .categories
                            .iter()
                            .any(|c| cache.categories.get(c).is_some_and(|e| e.is_cooling(now)))
                        {
                            blocked.push(action.rule_id);
                            continue;
                        }

                        // Accepted: cooldowns restart, send-once is consumed.
                        for category in &action.categories {
                            cache.categories.insert(
                                category.clone(),
                                CachedActionCategoryTime {
                                    last_sent: now,
                                    wait: waits[category.as_str()],
                                },
                            );
                        }
                        if !action.send_always {
                            cache.actions.remove(&action.rule_id);
                        }
                        sendable.push(action);
                    }

                    (sendable, blocked, unknown_categories)
                },
            )
            .await;

        match result {
            Ok((sendable, blocked, unknown_categories)) => {
                let fault = if unknown_categories.is_empty() {
                    None
                } else {
                    let description = unknown_categories
                        .iter()
                        .map(|(rule, category)| {
                            format!("rule '{}' references unknown category '{}'", rule, category)
                        })
                        .collect::<Vec<_>>()
                        .join("; ");
                    self.telemetry.post_fault(
                        FaultSeverity::Critical,
                        "notify/unknown-category",
                        &description,
                    );
                    Some(description)
                };
                debug!(
                    sendable = sendable.len(),
                    blocked = blocked.len(),
                    "sendability decided"
                );
                SendOutcome {
                    sendable,
                    blocked,
                    fault,
                }
            }
            Err(e) => self.conservative_fallback(candidates, &e),
        }
    }

    /// Lock timeout or cache failure: treat every gated action as not
    /// sendable rather than risk a lost update or a double send.
    fn conservative_fallback(
        &self,
        candidates: Vec<ActionResponse>,
        error: &BeaconError,
    ) -> SendOutcome {
        let (sendable, withheld): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|a| a.send_always && a.categories.is_empty());
        let blocked: Vec<String> = withheld.into_iter().map(|a| a.rule_id).collect();

        self.report_degradation("get_sendable_actions_from_set", error, &blocked);

        SendOutcome {
            sendable,
            fault: Some(format!(
                "cache unavailable ({}); {} gated action(s) withheld",
                error,
                blocked.len()
            )),
            blocked,
        }
    }

    fn report_degradation(&self, operation: &str, error: &BeaconError, blocked: &[String]) {
        warn!(operation, error = %error, ?blocked, "notification cache degraded");
        self.telemetry.post_fault(
            FaultSeverity::General,
            "notify/cache-degraded",
            &format!(
                "{} failed: {} (blocked rules: [{}])",
                operation,
                error,
                blocked.join(", ")
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::MemoryTelemetry;
    use fs2::FileExt;

    fn action(rule_id: &str, send_always: bool, categories: &[&str]) -> ActionResponse {
        ActionResponse {
            rule_id: rule_id.to_string(),
            action_path: "Actions\\Test".to_string(),
            precedence: 0,
            flight_name: None,
            send_always,
            categories: categories.iter().map(|s| s.to_string()).collect(),
            triggers: None,
            trigger_options: None,
            max_wait: None,
            action: serde_json::Value::Null,
        }
    }

    fn engine(
        dir: &tempfile::TempDir,
        clock: Arc<ManualClock>,
        telemetry: Arc<MemoryTelemetry>,
    ) -> CourtesyEngine {
        CourtesyEngine::new(
            CacheRepository::new(dir.path().join("cache.json")),
            telemetry,
        )
        .with_clock(clock)
        .with_category_waits(HashMap::from([(
            "survey".to_string(),
            Duration::from_secs(3_600),
        )]))
    }

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::starting_at(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn send_once_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, manual_clock(), Arc::new(MemoryTelemetry::new()));
        let candidates = vec![action("rule-1", false, &[])];

        engine
            .merge_new_response(&candidates, &HashSet::new())
            .await
            .unwrap();

        let first = engine
            .get_sendable_actions_from_set(candidates.clone())
            .await;
        assert_eq!(first.sendable.len(), 1);
        assert!(first.fault.is_none());

        // Consumed: the same rule is excluded on the second ask.
        let second = engine.get_sendable_actions_from_set(candidates).await;
        assert!(second.sendable.is_empty());
        assert_eq!(second.blocked, vec!["rule-1"]);
    }

    #[tokio::test]
    async fn send_always_is_never_gated() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, manual_clock(), Arc::new(MemoryTelemetry::new()));
        let candidates = vec![action("banner", true, &[])];

        for _ in 0..3 {
            let outcome = engine
                .get_sendable_actions_from_set(candidates.clone())
                .await;
            assert_eq!(outcome.sendable.len(), 1);
        }
    }

    #[tokio::test]
    async fn category_courtesy_window_blocks_then_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let engine = engine(&dir, clock.clone(), Arc::new(MemoryTelemetry::new()));

        let first = vec![action("rule-1", false, &["survey"])];
        let second = vec![action("rule-2", false, &["survey"])];
        let known = HashSet::new();
        engine.merge_new_response(&first, &known).await.unwrap();
        engine.merge_new_response(&second, &known).await.unwrap();

        assert_eq!(
            engine
                .get_sendable_actions_from_set(first)
                .await
                .sendable
                .len(),
            1
        );

        // Within the hour: the shared category is cooling.
        clock.advance(Duration::from_secs(30 * 60));
        let blocked = engine
            .get_sendable_actions_from_set(second.clone())
            .await;
        assert!(blocked.sendable.is_empty());
        assert_eq!(blocked.blocked, vec!["rule-2"]);

        // After the hour: the window reopened.
        clock.advance(Duration::from_secs(31 * 60));
        let open = engine.get_sendable_actions_from_set(second).await;
        assert_eq!(open.sendable.len(), 1);
    }

    #[tokio::test]
    async fn both_candidates_in_one_set_share_the_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, manual_clock(), Arc::new(MemoryTelemetry::new()));

        let candidates = vec![
            action("rule-1", false, &["survey"]),
            action("rule-2", false, &["survey"]),
        ];
        engine
            .merge_new_response(&candidates, &HashSet::new())
            .await
            .unwrap();

        let outcome = engine.get_sendable_actions_from_set(candidates).await;
        assert_eq!(outcome.sendable.len(), 1);
        assert_eq!(outcome.sendable[0].rule_id, "rule-1");
        assert_eq!(outcome.blocked, vec!["rule-2"]);
    }

    #[tokio::test]
    async fn unknown_category_is_a_hard_fault() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = Arc::new(MemoryTelemetry::new());
        let engine = engine(&dir, manual_clock(), telemetry.clone());

        let candidates = vec![action("rule-1", true, &["not-configured"])];
        let outcome = engine.get_sendable_actions_from_set(candidates).await;

        assert!(outcome.sendable.is_empty());
        assert_eq!(outcome.blocked, vec!["rule-1"]);
        assert!(outcome.fault.unwrap().contains("not-configured"));
        assert!(telemetry
            .faults()
            .iter()
            .any(|(severity, name, _)| *severity == FaultSeverity::Critical
                && name == "notify/unknown-category"));
    }

    #[tokio::test]
    async fn expired_send_once_entries_are_swept_on_merge() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let engine = engine(&dir, clock.clone(), Arc::new(MemoryTelemetry::new()));

        let mut expiring = action("rule-1", false, &[]);
        expiring.max_wait = Some("1h".to_string());
        engine
            .merge_new_response(&[expiring.clone()], &HashSet::new())
            .await
            .unwrap();

        // Past the max wait: the next merge (rule now known to the caller)
        // sweeps the entry, so the rule is no longer sendable.
        clock.advance(Duration::from_secs(2 * 3_600));
        let known = HashSet::from(["rule-1".to_string()]);
        engine.merge_new_response(&[expiring], &known).await.unwrap();

        let outcome = engine
            .get_sendable_actions_from_set(vec![action("rule-1", false, &[])])
            .await;
        assert!(outcome.sendable.is_empty());
    }

    #[tokio::test]
    async fn cached_time_is_preserved_for_repeated_merges() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let engine = engine(&dir, clock.clone(), Arc::new(MemoryTelemetry::new()));

        let mut expiring = action("rule-1", false, &[]);
        expiring.max_wait = Some("1h".to_string());
        engine
            .merge_new_response(&[expiring.clone()], &HashSet::new())
            .await
            .unwrap();

        // A second merge 50 minutes in must not restart the clock: the
        // entry still expires relative to the original cached_time.
        clock.advance(Duration::from_secs(50 * 60));
        engine
            .merge_new_response(&[expiring.clone()], &HashSet::new())
            .await
            .unwrap();
        clock.advance(Duration::from_secs(15 * 60));
        engine
            .merge_new_response(&[expiring], &HashSet::from(["rule-1".to_string()]))
            .await
            .unwrap();

        let outcome = engine
            .get_sendable_actions_from_set(vec![action("rule-1", false, &[])])
            .await;
        assert!(outcome.sendable.is_empty());
    }

    #[tokio::test]
    async fn lock_timeout_degrades_conservatively() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = Arc::new(MemoryTelemetry::new());
        let engine = engine(&dir, manual_clock(), telemetry.clone())
            .with_lock_timeout(Duration::from_millis(100));

        // Hold the lock so every acquisition times out.
        let holder = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(dir.path().join("cache.json.lock"))
            .unwrap();
        holder.lock_exclusive().unwrap();

        let candidates = vec![
            action("free", true, &[]),
            action("always-with-category", true, &["survey"]),
            action("send-once", false, &[]),
        ];
        let outcome = engine.get_sendable_actions_from_set(candidates).await;

        // Exactly the send_always, category-free subset survives.
        assert_eq!(outcome.sendable.len(), 1);
        assert_eq!(outcome.sendable[0].rule_id, "free");
        assert_eq!(
            outcome.blocked,
            vec!["always-with-category".to_string(), "send-once".to_string()]
        );
        assert!(outcome.fault.is_some());
        assert!(telemetry
            .faults()
            .iter()
            .any(|(_, name, _)| name == "notify/cache-degraded"));

        FileExt::unlock(&holder).unwrap();
    }
}
