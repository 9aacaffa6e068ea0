//! Scoped candidate resolution.
//!
//! Given the ordered candidate list for a setting, the first candidate whose
//! scope evaluates true wins; the unscoped candidate is the fallback when no
//! scope matches. Evaluation errors deny the candidate (the scope engine
//! logs the diagnostic), so absence and degradation look identical to the
//! caller.

use beacon_core::SettingValue;
use beacon_scope::{FilterProviders, ScopeEvaluator};

use crate::document::SettingsDocument;
use crate::model::{GroupedRemoteSettings, RemoteSetting};

pub struct SettingsResolver {
    evaluator: ScopeEvaluator,
}

impl SettingsResolver {
    pub fn new(evaluator: ScopeEvaluator) -> Self {
        Self { evaluator }
    }

    /// Build a resolver for a parsed document, wiring its named-scope table
    /// into the evaluator.
    pub fn for_document(providers: FilterProviders, document: &SettingsDocument) -> Self {
        Self::new(ScopeEvaluator::with_scopes(
            providers,
            document.scopes.clone(),
        ))
    }

    pub fn evaluator(&self) -> &ScopeEvaluator {
        &self.evaluator
    }

    /// Pick the applicable candidate, evaluating scopes synchronously.
    pub fn resolve<'a>(&self, candidates: &'a [RemoteSetting]) -> Option<&'a RemoteSetting> {
        let mut fallback = None;
        for candidate in candidates {
            match &candidate.scope {
                None => {
                    if fallback.is_none() {
                        fallback = Some(candidate);
                    }
                }
                Some(scope) => {
                    if self.evaluator.evaluate(scope) {
                        return Some(candidate);
                    }
                }
            }
        }
        fallback
    }

    /// Pick the applicable candidate, evaluating scopes asynchronously.
    pub async fn resolve_async<'a>(
        &self,
        candidates: &'a [RemoteSetting],
    ) -> Option<&'a RemoteSetting> {
        let mut fallback = None;
        for candidate in candidates {
            match &candidate.scope {
                None => {
                    if fallback.is_none() {
                        fallback = Some(candidate);
                    }
                }
                Some(scope) => {
                    if self.evaluator.evaluate_async(scope).await {
                        return Some(candidate);
                    }
                }
            }
        }
        fallback
    }

    /// Resolve a `(collection_path, key)` lookup against grouped settings.
    pub fn lookup(
        &self,
        settings: &GroupedRemoteSettings,
        path: &str,
        key: &str,
    ) -> Option<SettingValue> {
        let candidates = settings.candidates(path, key)?;
        self.resolve(candidates).map(|c| c.value.clone())
    }

    /// Async variant of [`lookup`](Self::lookup).
    pub async fn lookup_async(
        &self,
        settings: &GroupedRemoteSettings,
        path: &str,
        key: &str,
    ) -> Option<SettingValue> {
        let candidates = settings.candidates(path, key)?;
        self.resolve_async(candidates).await.map(|c| c.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use beacon_scope::{FilterValue, ValueFilter};

    struct Flag(bool);

    impl ValueFilter for Flag {
        fn value(&self) -> Option<FilterValue> {
            Some(FilterValue::Bool(self.0))
        }
    }

    fn resolver(beta: bool) -> SettingsResolver {
        let mut providers = FilterProviders::new();
        providers.register_value("Beta", Arc::new(Flag(beta)));
        SettingsResolver::new(ScopeEvaluator::new(providers))
    }

    fn candidate(scope: Option<&str>, value: i64) -> RemoteSetting {
        RemoteSetting {
            path: "P".to_string(),
            name: "k".to_string(),
            value: beacon_core::SettingValue::Int(value),
            scope: scope.map(String::from),
            origin: "test".to_string(),
        }
    }

    #[test]
    fn first_true_scope_wins() {
        let candidates = vec![
            candidate(Some("Beta"), 1),
            candidate(Some("1 == 1"), 2),
            candidate(None, 3),
        ];
        assert_eq!(
            resolver(true).resolve(&candidates).unwrap().value.as_int(),
            Some(1)
        );
        assert_eq!(
            resolver(false).resolve(&candidates).unwrap().value.as_int(),
            Some(2)
        );
    }

    #[test]
    fn unscoped_candidate_is_the_fallback() {
        let candidates = vec![candidate(None, 3), candidate(Some("Beta"), 1)];
        // Even listed first, the unscoped candidate only applies when no
        // scoped candidate matches.
        assert_eq!(
            resolver(true).resolve(&candidates).unwrap().value.as_int(),
            Some(1)
        );
        assert_eq!(
            resolver(false).resolve(&candidates).unwrap().value.as_int(),
            Some(3)
        );
    }

    #[test]
    fn no_match_and_no_fallback_is_none() {
        let candidates = vec![candidate(Some("Beta"), 1)];
        assert!(resolver(false).resolve(&candidates).is_none());
    }

    #[test]
    fn broken_scope_denies_that_candidate_only() {
        let candidates = vec![
            candidate(Some("Unknown.Filter =="), 1),
            candidate(None, 2),
        ];
        assert_eq!(
            resolver(true).resolve(&candidates).unwrap().value.as_int(),
            Some(2)
        );
    }

    #[tokio::test]
    async fn async_resolution_matches_sync() {
        let candidates = vec![
            candidate(Some("Beta"), 1),
            candidate(Some("1 == 1"), 2),
            candidate(None, 3),
        ];
        for beta in [true, false] {
            let r = resolver(beta);
            let sync = r.resolve(&candidates).map(|c| c.value.clone());
            let async_ = r.resolve_async(&candidates).await.map(|c| c.value.clone());
            assert_eq!(sync, async_);
        }
    }
}
