//! Versioned settings persistence.
//!
//! Applied documents are written into the storage backend namespaced by
//! their `FileVersion`, with a marker property naming the current version.
//! The marker flips only after a full write, and all non-current versions
//! are garbage-collected, so a reader either sees the previous complete
//! version or the new complete version — never a partial swap.
//!
//! Multiplicity is a naming convention: an unscoped candidate is stored
//! under its plain name, a scoped candidate under `name:scope`, and lookup
//! reassembles the ordered candidate list from stored property order.

use tokio::sync::Mutex;
use tracing::{debug, info};

use beacon_core::{BeaconError, SettingValue, SettingsStore, COLLECTION_SEPARATOR};
use beacon_scope::validate_scopes;

use crate::document::{SettingsDocument, FILE_VERSION_KEY, SCOPES_KEY};
use crate::model::RemoteSetting;

/// Versioned view over a [`SettingsStore`].
pub struct VersionedSettingsStore<S> {
    store: S,
    /// Root collection under which all versions live.
    root: String,
    /// Serializes version swaps; readers are lock-free by design.
    write_lock: Mutex<()>,
}

impl<S: SettingsStore> VersionedSettingsStore<S> {
    pub fn new(store: S, root: impl Into<String>) -> Self {
        Self {
            store,
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn join(&self, segments: &[&str]) -> String {
        let mut path = self.root.clone();
        for segment in segments {
            if segment.is_empty() {
                continue;
            }
            path.push(COLLECTION_SEPARATOR);
            path.push_str(segment);
        }
        path
    }

    /// The currently applied version, if any.
    pub async fn current_version(&self) -> Result<Option<String>, BeaconError> {
        Ok(self
            .store
            .get(&self.root, FILE_VERSION_KEY)
            .await?
            .and_then(|v| v.as_str().map(String::from)))
    }

    /// Whether `version` is already the applied one (skip redundant writes).
    pub async fn is_up_to_date(&self, version: &str) -> Result<bool, BeaconError> {
        Ok(self.current_version().await?.as_deref() == Some(version))
    }

    /// Apply a parsed document, replacing the stored rule-set.
    ///
    /// Returns `false` when the document's version is already applied and
    /// nothing was written.
    pub async fn apply(&self, document: &SettingsDocument) -> Result<bool, BeaconError> {
        let _guard = self.write_lock.lock().await;

        if self.is_up_to_date(&document.version).await? {
            debug!(version = %document.version, "settings version already applied");
            return Ok(false);
        }

        let base = self.join(&[&document.version]);

        for (name, expression) in &document.scopes {
            self.store
                .set(
                    &format!("{}{}{}", base, COLLECTION_SEPARATOR, SCOPES_KEY),
                    name,
                    SettingValue::Str(expression.clone()),
                )
                .await?;
        }

        for (path, possibilities) in document.settings.iter() {
            let collection = if path.is_empty() {
                base.clone()
            } else {
                format!("{}{}{}", base, COLLECTION_SEPARATOR, path)
            };
            for (name, candidates) in possibilities.iter() {
                for candidate in candidates {
                    let property = match &candidate.scope {
                        Some(scope) => format!("{}:{}", name, scope),
                        None => name.to_string(),
                    };
                    self.store
                        .set(&collection, &property, candidate.value.clone())
                        .await?;
                }
            }
        }

        // Flip the marker last, then drop every other version.
        self.store
            .set(
                &self.root,
                FILE_VERSION_KEY,
                SettingValue::Str(document.version.clone()),
            )
            .await?;
        self.gc().await?;

        info!(version = %document.version, root = %self.root, "applied settings version");
        Ok(true)
    }

    /// Remove all versions other than the current one.
    pub async fn gc(&self) -> Result<(), BeaconError> {
        let Some(current) = self.current_version().await? else {
            return Ok(());
        };
        for version in self.store.list_subcollections(&self.root).await? {
            if version != current {
                debug!(%version, "garbage-collecting stale settings version");
                self.store
                    .delete_collection(&self.join(&[&version]))
                    .await?;
            }
        }
        Ok(())
    }

    /// Stored candidate list for `(path, key)`, in stored (priority) order.
    pub async fn read_possibilities(
        &self,
        path: &str,
        key: &str,
    ) -> Result<Vec<RemoteSetting>, BeaconError> {
        let Some(version) = self.current_version().await? else {
            return Ok(Vec::new());
        };
        let collection = self.join(&[&version, path]);
        let scoped_prefix = format!("{}:", key);

        let mut candidates = Vec::new();
        for property in self.store.list_properties(&collection).await? {
            let scope = if property == key {
                None
            } else if let Some(scope) = property.strip_prefix(&scoped_prefix) {
                Some(scope.to_string())
            } else {
                continue;
            };
            if let Some(value) = self.store.get(&collection, &property).await? {
                candidates.push(RemoteSetting {
                    path: path.to_string(),
                    name: key.to_string(),
                    value,
                    scope,
                    origin: self.root.clone(),
                });
            }
        }
        Ok(candidates)
    }

    /// Setting names stored under a collection path (scope suffixes folded).
    pub async fn list_keys(&self, path: &str) -> Result<Vec<String>, BeaconError> {
        let Some(version) = self.current_version().await? else {
            return Ok(Vec::new());
        };
        let collection = self.join(&[&version, path]);
        let mut keys: Vec<String> = Vec::new();
        for property in self.store.list_properties(&collection).await? {
            let key = property
                .split_once(':')
                .map(|(name, _)| name.to_string())
                .unwrap_or(property);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Child collection names under a stored path.
    pub async fn list_subcollections(&self, path: &str) -> Result<Vec<String>, BeaconError> {
        let Some(version) = self.current_version().await? else {
            return Ok(Vec::new());
        };
        let collection = self.join(&[&version, path]);
        let mut children = self.store.list_subcollections(&collection).await?;
        if path.is_empty() {
            children.retain(|c| c != SCOPES_KEY);
        }
        Ok(children)
    }

    /// Whether any candidate exists for `(path, key)`.
    pub async fn exists(&self, path: &str, key: &str) -> Result<bool, BeaconError> {
        Ok(!self.read_possibilities(path, key).await?.is_empty())
    }

    /// The persisted named-scope table, re-validated as a standing integrity
    /// check before it is handed to an evaluator.
    pub async fn read_scopes(
        &self,
    ) -> Result<std::collections::HashMap<String, String>, BeaconError> {
        let Some(version) = self.current_version().await? else {
            return Ok(Default::default());
        };
        let collection = self.join(&[&version, SCOPES_KEY]);

        let mut scopes = std::collections::HashMap::new();
        for name in self.store.list_properties(&collection).await? {
            if let Some(SettingValue::Str(expression)) =
                self.store.get(&collection, &name).await?
            {
                scopes.insert(name, expression);
            }
        }
        validate_scopes(&scopes)
            .map_err(|e| BeaconError::Validation(format!("persisted scope table: {}", e)))?;
        Ok(scopes)
    }
}
