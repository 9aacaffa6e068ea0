//! Settings document parsing.
//!
//! A settings document is a JSON object whose nesting builds collection
//! paths and whose leaves are setting values. Leaf keys may carry a scope
//! reference after a colon (`"enabled:Scope.IsBeta"`), and the reserved
//! top-level `Scopes` object is the named-scope table, validated for
//! reference cycles before anything else in the document is trusted.
//!
//! Parsing is all-or-nothing: a type error anywhere rejects the whole
//! document so a half-applied rule-set can never be observed.

use std::collections::{HashMap, VecDeque};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use beacon_core::{SettingValue, COLLECTION_SEPARATOR};
use beacon_scope::validate_scopes;

use crate::model::{GroupedRemoteSettings, RemoteSetting};

/// Reserved top-level key holding the named-scope table.
pub const SCOPES_KEY: &str = "Scopes";

/// Reserved top-level key carrying the document version.
pub const FILE_VERSION_KEY: &str = "FileVersion";

// ── Error type ──────────────────────────────────────────────────────

/// Errors that reject an entire settings document.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// Not valid JSON at all.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Structurally valid JSON with an unsupported shape or leaf type.
    #[error("malformed document: {0}")]
    Malformed(String),

    /// The `Scopes` table contains a reference cycle.
    #[error("scope validation failed: {0}")]
    Scopes(#[from] beacon_scope::ScopeError),
}

// ── Parsed document ─────────────────────────────────────────────────

/// A fully parsed and validated settings document.
#[derive(Debug, Clone)]
pub struct SettingsDocument {
    /// Declared `FileVersion`, or a content hash when the document does not
    /// declare one.
    pub version: String,
    /// Named-scope table, already cycle-validated.
    pub scopes: HashMap<String, String>,
    pub settings: GroupedRemoteSettings,
}

/// Parse a settings document.
///
/// `origin` names the source for diagnostics; `global_scope`, when present,
/// is conjoined (`&&`) onto every leaf's scope.
pub fn parse_document(
    text: &str,
    origin: &str,
    global_scope: Option<&str>,
) -> Result<SettingsDocument, DocumentError> {
    let root: Value = serde_json::from_str(text)?;
    let root = root
        .as_object()
        .ok_or_else(|| DocumentError::Malformed("document root must be an object".to_string()))?;

    let version = match root.get(FILE_VERSION_KEY) {
        Some(Value::String(v)) => v.clone(),
        Some(other) => {
            return Err(DocumentError::Malformed(format!(
                "'{}' must be a string, got {}",
                FILE_VERSION_KEY,
                json_kind(other)
            )))
        }
        None => content_version(text),
    };

    let scopes = parse_scopes(root)?;
    validate_scopes(&scopes)?;

    let mut settings = GroupedRemoteSettings::default();

    // Breadth-first walk, rebuilding collection paths from nesting.
    let mut queue: VecDeque<(String, &Map<String, Value>)> = VecDeque::new();
    queue.push_back((String::new(), root));

    while let Some((path, object)) = queue.pop_front() {
        for (key, value) in object {
            if path.is_empty() && (key == SCOPES_KEY || key == FILE_VERSION_KEY) {
                continue;
            }
            match value {
                Value::Object(child) => {
                    queue.push_back((join_path(&path, key), child));
                }
                leaf => {
                    let (name, scope) = split_scoped_name(key);
                    let scope = conjoin_global(scope, global_scope);
                    let value = leaf_value(leaf).ok_or_else(|| {
                        DocumentError::Malformed(format!(
                            "unsupported value type {} at '{}' key '{}'",
                            json_kind(leaf),
                            path,
                            key
                        ))
                    })?;
                    settings.insert(RemoteSetting {
                        path: path.clone(),
                        name,
                        value,
                        scope,
                        origin: origin.to_string(),
                    });
                }
            }
        }
    }

    debug!(
        origin,
        version = %version,
        scopes = scopes.len(),
        "parsed settings document"
    );

    Ok(SettingsDocument {
        version,
        scopes,
        settings,
    })
}

fn parse_scopes(root: &Map<String, Value>) -> Result<HashMap<String, String>, DocumentError> {
    let Some(value) = root.get(SCOPES_KEY) else {
        return Ok(HashMap::new());
    };
    let table = value.as_object().ok_or_else(|| {
        DocumentError::Malformed(format!("'{}' must be an object", SCOPES_KEY))
    })?;

    let mut scopes = HashMap::with_capacity(table.len());
    for (name, expression) in table {
        let expression = expression.as_str().ok_or_else(|| {
            DocumentError::Malformed(format!(
                "scope '{}' must be a string expression, got {}",
                name,
                json_kind(expression)
            ))
        })?;
        scopes.insert(name.clone(), expression.to_string());
    }
    Ok(scopes)
}

/// Split a `name:scopeReference` leaf key.
fn split_scoped_name(key: &str) -> (String, Option<String>) {
    match key.split_once(':') {
        Some((name, scope)) if !scope.is_empty() => (name.to_string(), Some(scope.to_string())),
        _ => (key.to_string(), None),
    }
}

fn conjoin_global(scope: Option<String>, global: Option<&str>) -> Option<String> {
    match (scope, global) {
        (Some(s), Some(g)) => Some(format!("({}) && ({})", s, g)),
        (None, Some(g)) => Some(g.to_string()),
        (scope, None) => scope,
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}{}{}", path, COLLECTION_SEPARATOR, key)
    }
}

fn leaf_value(value: &Value) -> Option<SettingValue> {
    match value {
        Value::String(s) => Some(SettingValue::Str(s.clone())),
        Value::Bool(b) => Some(SettingValue::Bool(*b)),
        Value::Number(n) => n.as_i64().map(SettingValue::Int),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Version for documents that do not declare one: a content hash, so
/// unchanged content is recognized as already applied.
fn content_version(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    // 16 hex chars is plenty for change detection.
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"{
        "FileVersion": "42",
        "Scopes": {
            "IsBeta": "Flight.Beta"
        },
        "Feature\\X": {
            "enabled:Scope.IsBeta": true,
            "enabled": false,
            "limit": 10,
            "Nested": {
                "label": "hello"
            }
        }
    }"#;

    #[test]
    fn parses_paths_names_and_scopes() {
        let doc = parse_document(DOCUMENT, "test", None).unwrap();
        assert_eq!(doc.version, "42");
        assert_eq!(doc.scopes["IsBeta"], "Flight.Beta");

        let enabled = doc.settings.candidates("Feature\\X", "enabled").unwrap();
        assert_eq!(enabled.len(), 2);
        assert_eq!(enabled[0].scope.as_deref(), Some("Scope.IsBeta"));
        assert_eq!(enabled[0].value, SettingValue::Bool(true));
        assert_eq!(enabled[1].scope, None);
        assert_eq!(enabled[1].value, SettingValue::Bool(false));

        let limit = doc.settings.candidates("Feature\\X", "limit").unwrap();
        assert_eq!(limit[0].value, SettingValue::Int(10));

        // Nesting extends the collection path.
        let label = doc
            .settings
            .candidates("Feature\\X\\Nested", "label")
            .unwrap();
        assert_eq!(label[0].value, SettingValue::Str("hello".to_string()));
    }

    #[test]
    fn global_scope_is_conjoined_onto_every_leaf() {
        let doc = parse_document(DOCUMENT, "test", Some("Flight.Ring0")).unwrap();
        let enabled = doc.settings.candidates("Feature\\X", "enabled").unwrap();
        assert_eq!(
            enabled[0].scope.as_deref(),
            Some("(Scope.IsBeta) && (Flight.Ring0)")
        );
        assert_eq!(enabled[1].scope.as_deref(), Some("Flight.Ring0"));
    }

    #[test]
    fn missing_version_falls_back_to_content_hash() {
        let a = parse_document(r#"{"K": {"v": 1}}"#, "test", None).unwrap();
        let b = parse_document(r#"{"K": {"v": 1}}"#, "test", None).unwrap();
        let c = parse_document(r#"{"K": {"v": 2}}"#, "test", None).unwrap();
        assert_eq!(a.version, b.version);
        assert_ne!(a.version, c.version);
    }

    #[test]
    fn cyclic_scope_table_rejects_whole_document() {
        let text = r#"{
            "Scopes": {"A": "Scope.B", "B": "Scope.A"},
            "Feature": {"enabled": true}
        }"#;
        let err = parse_document(text, "test", None).unwrap_err();
        assert!(matches!(err, DocumentError::Scopes(_)));
    }

    #[test]
    fn bad_leaf_type_rejects_whole_document() {
        let text = r#"{"Feature": {"values": [1, 2, 3]}}"#;
        assert!(matches!(
            parse_document(text, "test", None),
            Err(DocumentError::Malformed(_))
        ));

        let text = r#"{"Feature": {"ratio": 1.5}}"#;
        assert!(matches!(
            parse_document(text, "test", None),
            Err(DocumentError::Malformed(_))
        ));
    }

    #[test]
    fn bad_scopes_table_rejects_whole_document() {
        let text = r#"{"Scopes": {"A": 1}}"#;
        assert!(matches!(
            parse_document(text, "test", None),
            Err(DocumentError::Malformed(_))
        ));

        let text = r#"{"Scopes": "not-a-table"}"#;
        assert!(matches!(
            parse_document(text, "test", None),
            Err(DocumentError::Malformed(_))
        ));
    }

    #[test]
    fn not_json_is_a_parse_error() {
        assert!(matches!(
            parse_document("not json at all", "test", None),
            Err(DocumentError::Json(_))
        ));
        assert!(matches!(
            parse_document("[1, 2]", "test", None),
            Err(DocumentError::Malformed(_))
        ));
    }
}
