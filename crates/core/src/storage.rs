//! Key-value collection storage boundary.
//!
//! Settings are persisted into a platform backend (registry-style on Windows,
//! file-backed elsewhere) addressed by `collection_path` + `key`. The backend
//! is a collaborator: this crate specifies the trait and ships an in-memory
//! implementation used for volatile "live" settings and tests.

use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::error::BeaconError;
use crate::value::SettingValue;

/// Separator between collection path segments, e.g. `Feature\X`.
pub const COLLECTION_SEPARATOR: char = '\\';

/// Storage backend for settings collections.
///
/// Property order within a collection is meaningful: implementations must
/// list properties in insertion order, since candidate precedence is derived
/// from write order.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Read a single property, `None` when absent.
    async fn get(&self, collection_path: &str, key: &str)
        -> Result<Option<SettingValue>, BeaconError>;

    /// Write a single property, creating the collection if needed.
    async fn set(
        &self,
        collection_path: &str,
        key: &str,
        value: SettingValue,
    ) -> Result<(), BeaconError>;

    /// Remove a single property. Removing an absent property is not an error.
    async fn delete(&self, collection_path: &str, key: &str) -> Result<(), BeaconError>;

    /// Remove a collection and everything below it.
    async fn delete_collection(&self, collection_path: &str) -> Result<(), BeaconError>;

    /// Property names directly inside a collection, in insertion order.
    async fn list_properties(&self, collection_path: &str) -> Result<Vec<String>, BeaconError>;

    /// Names of direct child collections.
    async fn list_subcollections(&self, collection_path: &str)
        -> Result<Vec<String>, BeaconError>;

    /// Whether a property exists.
    async fn exists(&self, collection_path: &str, key: &str) -> Result<bool, BeaconError> {
        Ok(self.get(collection_path, key).await?.is_some())
    }
}

/// Blanket implementation so `Arc<dyn SettingsStore>` can be used directly.
#[async_trait]
impl<T: SettingsStore + ?Sized> SettingsStore for Arc<T> {
    async fn get(
        &self,
        collection_path: &str,
        key: &str,
    ) -> Result<Option<SettingValue>, BeaconError> {
        (**self).get(collection_path, key).await
    }

    async fn set(
        &self,
        collection_path: &str,
        key: &str,
        value: SettingValue,
    ) -> Result<(), BeaconError> {
        (**self).set(collection_path, key, value).await
    }

    async fn delete(&self, collection_path: &str, key: &str) -> Result<(), BeaconError> {
        (**self).delete(collection_path, key).await
    }

    async fn delete_collection(&self, collection_path: &str) -> Result<(), BeaconError> {
        (**self).delete_collection(collection_path).await
    }

    async fn list_properties(&self, collection_path: &str) -> Result<Vec<String>, BeaconError> {
        (**self).list_properties(collection_path).await
    }

    async fn list_subcollections(
        &self,
        collection_path: &str,
    ) -> Result<Vec<String>, BeaconError> {
        (**self).list_subcollections(collection_path).await
    }

    async fn exists(&self, collection_path: &str, key: &str) -> Result<bool, BeaconError> {
        (**self).exists(collection_path, key).await
    }
}

// ── In-memory store ─────────────────────────────────────────────────

/// Thread-safe in-memory `SettingsStore`.
///
/// Collections are keyed by full path; properties keep insertion order via
/// `IndexMap` so lookup precedence survives a round trip through storage.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<IndexMap<String, IndexMap<String, SettingValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(path: &str) -> String {
        path.trim_matches(COLLECTION_SEPARATOR).to_string()
    }

    fn poisoned(_e: impl std::fmt::Display) -> BeaconError {
        BeaconError::Storage("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get(
        &self,
        collection_path: &str,
        key: &str,
    ) -> Result<Option<SettingValue>, BeaconError> {
        let collections = self.collections.read().map_err(Self::poisoned)?;
        Ok(collections
            .get(&Self::normalize(collection_path))
            .and_then(|c| c.get(key))
            .cloned())
    }

    async fn set(
        &self,
        collection_path: &str,
        key: &str,
        value: SettingValue,
    ) -> Result<(), BeaconError> {
        let mut collections = self.collections.write().map_err(Self::poisoned)?;
        collections
            .entry(Self::normalize(collection_path))
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, collection_path: &str, key: &str) -> Result<(), BeaconError> {
        let mut collections = self.collections.write().map_err(Self::poisoned)?;
        if let Some(collection) = collections.get_mut(&Self::normalize(collection_path)) {
            collection.shift_remove(key);
        }
        Ok(())
    }

    async fn delete_collection(&self, collection_path: &str) -> Result<(), BeaconError> {
        let path = Self::normalize(collection_path);
        let prefix = format!("{}{}", path, COLLECTION_SEPARATOR);
        let mut collections = self.collections.write().map_err(Self::poisoned)?;
        collections.retain(|name, _| name != &path && !name.starts_with(&prefix));
        Ok(())
    }

    async fn list_properties(&self, collection_path: &str) -> Result<Vec<String>, BeaconError> {
        let collections = self.collections.read().map_err(Self::poisoned)?;
        Ok(collections
            .get(&Self::normalize(collection_path))
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_subcollections(
        &self,
        collection_path: &str,
    ) -> Result<Vec<String>, BeaconError> {
        let path = Self::normalize(collection_path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}{}", path, COLLECTION_SEPARATOR)
        };

        let collections = self.collections.read().map_err(Self::poisoned)?;
        let mut children: Vec<String> = Vec::new();
        for name in collections.keys() {
            let rest = match name.strip_prefix(&prefix) {
                Some(rest) if !rest.is_empty() => rest,
                _ => continue,
            };
            let child = rest
                .split(COLLECTION_SEPARATOR)
                .next()
                .unwrap_or(rest)
                .to_string();
            if !children.contains(&child) {
                children.push(child);
            }
        }
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let store = MemoryStore::new();
        store
            .set("Feature\\X", "enabled", SettingValue::Bool(true))
            .await
            .unwrap();

        assert_eq!(
            store.get("Feature\\X", "enabled").await.unwrap(),
            Some(SettingValue::Bool(true))
        );
        assert!(store.exists("Feature\\X", "enabled").await.unwrap());

        store.delete("Feature\\X", "enabled").await.unwrap();
        assert_eq!(store.get("Feature\\X", "enabled").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_properties_preserves_insertion_order() {
        let store = MemoryStore::new();
        for key in ["c", "a", "b"] {
            store
                .set("Coll", key, SettingValue::Int(1))
                .await
                .unwrap();
        }
        assert_eq!(
            store.list_properties("Coll").await.unwrap(),
            vec!["c", "a", "b"]
        );
    }

    #[tokio::test]
    async fn list_subcollections_returns_direct_children_only() {
        let store = MemoryStore::new();
        store
            .set("Root\\A", "k", SettingValue::Int(1))
            .await
            .unwrap();
        store
            .set("Root\\A\\Deep", "k", SettingValue::Int(2))
            .await
            .unwrap();
        store
            .set("Root\\B", "k", SettingValue::Int(3))
            .await
            .unwrap();

        assert_eq!(
            store.list_subcollections("Root").await.unwrap(),
            vec!["A", "B"]
        );
    }

    #[tokio::test]
    async fn delete_collection_removes_subtree() {
        let store = MemoryStore::new();
        store
            .set("Root\\A", "k", SettingValue::Int(1))
            .await
            .unwrap();
        store
            .set("Root\\A\\Deep", "k", SettingValue::Int(2))
            .await
            .unwrap();
        store
            .set("Other", "k", SettingValue::Int(3))
            .await
            .unwrap();

        store.delete_collection("Root\\A").await.unwrap();

        assert_eq!(store.get("Root\\A", "k").await.unwrap(), None);
        assert_eq!(store.get("Root\\A\\Deep", "k").await.unwrap(), None);
        assert_eq!(
            store.get("Other", "k").await.unwrap(),
            Some(SettingValue::Int(3))
        );
    }
}
