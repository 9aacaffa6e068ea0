//! Downloaded action rules.
//!
//! An `ActionResponse` is one rule from the actions document, already
//! scope-filtered upstream: the cache and courtesy engine only decide
//! whether it is currently *sendable*, and the trigger manager wires its
//! trigger conditions to telemetry events.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use beacon_core::EventMatch;

/// Per-trigger delivery options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerOptions {
    /// Fire immediately on subscription instead of waiting for an event
    /// match. Only the `start` trigger may request this.
    #[serde(default)]
    pub trigger_on_subscribe: bool,
    /// Stay subscribed after the first fire.
    #[serde(default)]
    pub trigger_always: bool,
}

/// A downloaded rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub rule_id: String,
    /// Collection path the rule's payload is served under.
    pub action_path: String,
    /// Merge-order-derived priority among matching rules.
    #[serde(default)]
    pub precedence: i64,
    /// Experiment cohort that delivered this rule, if any.
    #[serde(default)]
    pub flight_name: Option<String>,
    /// `false` marks a send-once rule gated through the notification cache.
    #[serde(default)]
    pub send_always: bool,
    /// Courtesy categories this rule participates in.
    #[serde(default)]
    pub categories: Vec<String>,
    /// Trigger name → telemetry event match. `start` may omit its match
    /// only when its options request `trigger_on_subscribe`.
    #[serde(default)]
    pub triggers: Option<HashMap<String, Option<EventMatch>>>,
    #[serde(default)]
    pub trigger_options: Option<HashMap<String, TriggerOptions>>,
    /// How long a send-once rule stays pending before it is evicted,
    /// e.g. "14d" or "12h30m". Defaults to the engine's 14-day window.
    #[serde(default)]
    pub max_wait: Option<String>,
    /// The typed payload, deserialized by the consumer.
    pub action: serde_json::Value,
}

impl ActionResponse {
    /// The rule's max-wait window, when it declares a parseable one.
    pub fn max_wait_duration(&self) -> Option<Duration> {
        self.max_wait.as_deref().and_then(parse_wait)
    }
}

// ── Wait parsing ────────────────────────────────────────────────────

/// Parse a human-readable duration string into a [`Duration`].
///
/// Supports components: `Xd` (days), `Xh` (hours), `Xm` (minutes), `Xs` (seconds).
/// Components can be combined: "2h30m", "1d12h", "90s". A bare number is
/// seconds. Returns `None` if the string is empty or unparseable.
pub fn parse_wait(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();
    let mut found_unit = false;

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
        } else {
            let n: u64 = num_buf.parse().ok()?;
            num_buf.clear();
            match ch {
                'd' => total_secs += n * 86_400,
                'h' => total_secs += n * 3_600,
                'm' => total_secs += n * 60,
                's' => total_secs += n,
                _ => return None,
            }
            found_unit = true;
        }
    }

    // Handle trailing number without unit (treat as seconds).
    if !num_buf.is_empty() {
        if found_unit {
            // Ambiguous: "30m15" — reject rather than guess.
            return None;
        }
        let n: u64 = num_buf.parse().ok()?;
        total_secs += n;
    }

    if total_secs == 0 && !found_unit {
        return None;
    }

    Some(Duration::from_secs(total_secs))
}
