//! Remote setting model and merge semantics.
//!
//! Raw `path`/`name`/`value`/`scope` tuples from a parsed document are
//! grouped into ordered candidate lists per `(path, name)`; merging a later
//! source overwrites candidates with an identical `(name, scope)` identity
//! and prepends the rest, so the most recently merged source wins ties and
//! gets lookup priority.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use beacon_core::SettingValue;

/// One candidate value for a setting.
///
/// Two settings are "the same setting" iff `name` and `scope` are equal;
/// `path` groups them, `origin` names the source for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSetting {
    pub path: String,
    pub name: String,
    pub value: SettingValue,
    /// Scope expression gating this candidate; `None` is the unscoped
    /// fallback.
    pub scope: Option<String>,
    pub origin: String,
}

impl RemoteSetting {
    /// Identity for merge: equal `(name, scope)`.
    pub fn same_setting(&self, other: &RemoteSetting) -> bool {
        self.name == other.name && self.scope == other.scope
    }
}

/// Ordered candidate lists for the settings of one collection path, keyed by
/// setting name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteSettingPossibilities {
    candidates: IndexMap<String, Vec<RemoteSetting>>,
}

impl RemoteSettingPossibilities {
    pub fn insert(&mut self, setting: RemoteSetting) {
        self.candidates
            .entry(setting.name.clone())
            .or_default()
            .push(setting);
    }

    pub fn get(&self, name: &str) -> Option<&[RemoteSetting]> {
        self.candidates.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.candidates.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[RemoteSetting])> {
        self.candidates
            .iter()
            .map(|(name, list)| (name.as_str(), list.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Merge another possibility set into this one.
    ///
    /// A candidate with an identical `(name, scope)` overwrites in place;
    /// everything else is prepended in the incoming order, ahead of the
    /// existing candidates.
    pub fn merge(&mut self, other: RemoteSettingPossibilities) {
        for (name, incoming) in other.candidates {
            let list = self.candidates.entry(name).or_default();
            let mut front: Vec<RemoteSetting> = Vec::new();
            for candidate in incoming {
                match list.iter().position(|c| c.same_setting(&candidate)) {
                    Some(pos) => list[pos] = candidate,
                    None => front.push(candidate),
                }
            }
            if !front.is_empty() {
                front.append(list);
                *list = front;
            }
        }
    }
}

/// All settings of one parsed document (or several merged ones), grouped by
/// collection path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupedRemoteSettings {
    groups: IndexMap<String, RemoteSettingPossibilities>,
}

impl GroupedRemoteSettings {
    pub fn insert(&mut self, setting: RemoteSetting) {
        self.groups
            .entry(setting.path.clone())
            .or_default()
            .insert(setting);
    }

    pub fn get(&self, path: &str) -> Option<&RemoteSettingPossibilities> {
        self.groups.get(path)
    }

    pub fn candidates(&self, path: &str, name: &str) -> Option<&[RemoteSetting]> {
        self.groups.get(path).and_then(|p| p.get(name))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RemoteSettingPossibilities)> {
        self.groups.iter().map(|(path, p)| (path.as_str(), p))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Merge a later-fetched document's settings into this one, path by path.
    pub fn merge(&mut self, other: GroupedRemoteSettings) {
        for (path, possibilities) in other.groups {
            self.groups.entry(path).or_default().merge(possibilities);
        }
    }
}
