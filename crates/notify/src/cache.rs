//! Persisted notification cache model.
//!
//! The cache is a single JSON document keyed by rule id (pending send-once
//! rules) and category id (courtesy cooldowns). It is the unit of
//! cross-process locking; all mutation happens through
//! [`crate::repository::CacheRepository`].

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Pending-send tracking for one send-once rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedActionResponseTime {
    /// When the rule entered the cache.
    pub cached_time: DateTime<Utc>,
    /// How long the rule stays pending before it is evicted.
    pub max_wait: Duration,
}

impl CachedActionResponseTime {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        deadline(self.cached_time, self.max_wait).is_some_and(|d| now >= d)
    }
}

/// Cooldown tracking for one courtesy category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedActionCategoryTime {
    /// When a rule in this category was last sent.
    pub last_sent: DateTime<Utc>,
    /// Cooldown window during which nothing in the category may be sent.
    pub wait: Duration,
}

impl CachedActionCategoryTime {
    /// Whether the category is currently inside its cooldown window.
    pub fn is_cooling(&self, now: DateTime<Utc>) -> bool {
        match deadline(self.last_sent, self.wait) {
            Some(until) => now < until,
            // Unrepresentable deadline: the window never ends.
            None => true,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_cooling(now)
    }
}

/// `start + wait`, `None` when the sum is unrepresentable.
fn deadline(start: DateTime<Utc>, wait: Duration) -> Option<DateTime<Utc>> {
    let wait = chrono::Duration::from_std(wait).ok()?;
    start.checked_add_signed(wait)
}

/// The entire persisted local cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedTargetedNotifications {
    #[serde(default)]
    pub actions: HashMap<String, CachedActionResponseTime>,
    #[serde(default)]
    pub categories: HashMap<String, CachedActionCategoryTime>,
}

impl CachedTargetedNotifications {
    /// Deserialize a cache file's contents.
    ///
    /// Corruption is treated as empty-cache-and-reset, never a hard failure:
    /// losing courtesy state is recoverable, a wedged cache file is not.
    pub fn from_json_lenient(text: &str) -> Self {
        match serde_json::from_str(text) {
            Ok(cache) => cache,
            Err(e) => {
                warn!(error = %e, "notification cache corrupt, resetting");
                Self::default()
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
