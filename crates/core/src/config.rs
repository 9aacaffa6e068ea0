use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

/// Process-wide configuration, read from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root collection path under which versioned settings are stored.
    pub settings_root: String,
    /// Polling interval for settings document sources.
    pub poll_interval: Duration,
    /// Location of the cross-process notification cache file.
    pub cache_path: PathBuf,
    /// Bounded wait for the cache lock; `None` waits indefinitely.
    pub cache_lock_timeout: Option<Duration>,
    /// Root subcollections subject to the stable-setting freeze policy.
    pub stable_roots: Vec<String>,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        let cache_lock_timeout = env_opt("BEACON_CACHE_LOCK_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis);

        let stable_roots = env_or("BEACON_STABLE_ROOTS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Self {
            settings_root: env_or("BEACON_SETTINGS_ROOT", "RemoteSettings"),
            poll_interval: Duration::from_secs(env_u64("BEACON_POLL_INTERVAL_SECS", 1800)),
            cache_path: PathBuf::from(env_or(
                "BEACON_CACHE_PATH",
                "beacon_notification_cache.json",
            )),
            cache_lock_timeout,
            stable_roots,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings_root: "RemoteSettings".to_string(),
            poll_interval: Duration::from_secs(1800),
            cache_path: PathBuf::from("beacon_notification_cache.json"),
            cache_lock_timeout: None,
            stable_roots: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.settings_root, "RemoteSettings");
        assert_eq!(config.poll_interval, Duration::from_secs(1800));
        assert!(config.cache_lock_timeout.is_none());
        assert!(config.stable_roots.is_empty());
    }
}
