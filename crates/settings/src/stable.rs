//! Stable-setting freeze policy.
//!
//! Some root subcollections are configured as "stable": the first value a
//! process successfully reads under them is pinned for the process lifetime,
//! so a background refresh can never change an answer the process has
//! already acted on. Freezing is lazy and per-key — a key under a stable
//! root that has never been read follows refreshes like any other.

use std::future::Future;

use tracing::debug;

use beacon_core::{BeaconError, MemoryStore, SettingValue, SettingsStore, COLLECTION_SEPARATOR};

pub struct StableSettings {
    roots: Vec<String>,
    frozen: MemoryStore,
}

impl StableSettings {
    pub fn new<I, S>(roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            frozen: MemoryStore::new(),
        }
    }

    /// Whether a collection path falls under a frozen root.
    pub fn is_stable_path(&self, path: &str) -> bool {
        self.roots.iter().any(|root| {
            path == root
                || path
                    .strip_prefix(root.as_str())
                    .is_some_and(|rest| rest.starts_with(COLLECTION_SEPARATOR))
        })
    }

    /// Resolve `(path, key)` through `fetch`, pinning the first successful
    /// read under a stable root.
    pub async fn resolve_with<F, Fut>(
        &self,
        path: &str,
        key: &str,
        fetch: F,
    ) -> Result<Option<SettingValue>, BeaconError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<SettingValue>>,
    {
        if !self.is_stable_path(path) {
            return Ok(fetch().await);
        }

        if let Some(frozen) = self.frozen.get(path, key).await? {
            return Ok(Some(frozen));
        }

        let value = fetch().await;
        if let Some(value) = &value {
            debug!(path, key, %value, "freezing stable setting");
            self.frozen.set(path, key, value.clone()).await?;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_successful_read_wins_for_process_lifetime() {
        let stable = StableSettings::new(["Stable"]);

        let first = stable
            .resolve_with("Stable\\A", "k", || async { Some(SettingValue::Int(1)) })
            .await
            .unwrap();
        assert_eq!(first, Some(SettingValue::Int(1)));

        // A later refresh changed the underlying value; the frozen one wins.
        let second = stable
            .resolve_with("Stable\\A", "k", || async { Some(SettingValue::Int(2)) })
            .await
            .unwrap();
        assert_eq!(second, Some(SettingValue::Int(1)));
    }

    #[tokio::test]
    async fn unsuccessful_read_does_not_freeze() {
        let stable = StableSettings::new(["Stable"]);

        let miss = stable
            .resolve_with("Stable\\A", "k", || async { None })
            .await
            .unwrap();
        assert_eq!(miss, None);

        // The value becomes available later and freezes then.
        let hit = stable
            .resolve_with("Stable\\A", "k", || async { Some(SettingValue::Int(2)) })
            .await
            .unwrap();
        assert_eq!(hit, Some(SettingValue::Int(2)));
    }

    #[tokio::test]
    async fn non_stable_paths_follow_refreshes() {
        let stable = StableSettings::new(["Stable"]);

        for expected in [1, 2] {
            let value = stable
                .resolve_with("Volatile", "k", || async move {
                    Some(SettingValue::Int(expected))
                })
                .await
                .unwrap();
            assert_eq!(value, Some(SettingValue::Int(expected)));
        }
    }

    #[tokio::test]
    async fn keys_freeze_independently() {
        let stable = StableSettings::new(["Stable"]);
        stable
            .resolve_with("Stable", "a", || async { Some(SettingValue::Int(1)) })
            .await
            .unwrap();

        let b = stable
            .resolve_with("Stable", "b", || async { Some(SettingValue::Int(9)) })
            .await
            .unwrap();
        assert_eq!(b, Some(SettingValue::Int(9)));
    }

    #[test]
    fn stable_path_matching_is_prefix_by_segment() {
        let stable = StableSettings::new(["Stable"]);
        assert!(stable.is_stable_path("Stable"));
        assert!(stable.is_stable_path("Stable\\Child"));
        assert!(!stable.is_stable_path("StableOther"));
        assert!(!stable.is_stable_path("Volatile"));
    }
}
