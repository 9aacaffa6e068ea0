//! Filter provider registry.
//!
//! A filter provider is a named source of scope-evaluable values. Providers
//! come in four shapes — {single-value, multi-value} × {sync, async} — and a
//! bare `Name` reference must hit a single-value provider while `Name.Subkey`
//! must hit a multi-value one; a shape mismatch produces an invalid operand
//! at scan time, which only raises if the expression actually forces it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use beacon_core::FlightService;

use crate::error::ScopeError;
use crate::operand::{LazyOperand, Operand, ResolveOperand};

/// A concrete value produced by a filter provider.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Bool(bool),
    Double(f64),
    Str(String),
}

impl From<FilterValue> for Operand {
    fn from(value: FilterValue) -> Self {
        match value {
            FilterValue::Bool(b) => Operand::Bool(b),
            FilterValue::Double(d) => Operand::Double(d),
            FilterValue::Str(s) => Operand::Str(s),
        }
    }
}

// ── Provider shapes ─────────────────────────────────────────────────

/// Single-value synchronous provider (`Name`).
pub trait ValueFilter: Send + Sync {
    /// The provider's current value, `None` when it has none.
    fn value(&self) -> Option<FilterValue>;
}

/// Multi-value synchronous provider (`Name.Subkey`).
pub trait KeyedFilter: Send + Sync {
    fn value_for(&self, key: &str) -> Option<FilterValue>;
}

/// Single-value provider that may suspend.
#[async_trait]
pub trait AsyncValueFilter: Send + Sync {
    async fn value(&self) -> Option<FilterValue>;
}

/// Multi-value provider that may suspend.
#[async_trait]
pub trait AsyncKeyedFilter: Send + Sync {
    async fn value_for(&self, key: &str) -> Option<FilterValue>;
}

#[derive(Clone)]
enum Provider {
    Value(Arc<dyn ValueFilter>),
    Keyed(Arc<dyn KeyedFilter>),
    AsyncValue(Arc<dyn AsyncValueFilter>),
    AsyncKeyed(Arc<dyn AsyncKeyedFilter>),
}

impl Provider {
    fn is_keyed(&self) -> bool {
        matches!(self, Provider::Keyed(_) | Provider::AsyncKeyed(_))
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// Registry mapping provider name (case-insensitive) to provider capability.
#[derive(Default, Clone)]
pub struct FilterProviders {
    providers: HashMap<String, Provider>,
}

impl FilterProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_value(&mut self, name: &str, provider: Arc<dyn ValueFilter>) {
        self.providers
            .insert(name.to_ascii_lowercase(), Provider::Value(provider));
    }

    pub fn register_keyed(&mut self, name: &str, provider: Arc<dyn KeyedFilter>) {
        self.providers
            .insert(name.to_ascii_lowercase(), Provider::Keyed(provider));
    }

    pub fn register_async_value(&mut self, name: &str, provider: Arc<dyn AsyncValueFilter>) {
        self.providers
            .insert(name.to_ascii_lowercase(), Provider::AsyncValue(provider));
    }

    pub fn register_async_keyed(&mut self, name: &str, provider: Arc<dyn AsyncKeyedFilter>) {
        self.providers
            .insert(name.to_ascii_lowercase(), Provider::AsyncKeyed(provider));
    }

    /// Register the built-in `Flight` provider over a flight service.
    pub fn register_flights(&mut self, flights: Arc<dyn FlightService>) {
        self.register_async_keyed("Flight", Arc::new(FlightFilter { flights }));
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.providers.contains_key(&name.to_ascii_lowercase())
    }

    /// Resolve a filter reference into an operand.
    ///
    /// Shape mismatches and unknown names yield `Operand::Invalid` rather
    /// than an error, matching parse-time failure semantics.
    pub(crate) fn resolve(&self, name: &str, subkey: Option<&str>) -> Operand {
        let reference = match subkey {
            Some(sub) => format!("{}.{}", name, sub),
            None => name.to_string(),
        };

        let provider = match self.providers.get(&name.to_ascii_lowercase()) {
            Some(p) => p.clone(),
            None => return Operand::Invalid(format!("unknown filter '{}'", reference)),
        };

        match (provider.is_keyed(), subkey) {
            (true, None) => {
                return Operand::Invalid(format!(
                    "filter '{}' requires a subkey (e.g. '{}.Key')",
                    name, name
                ))
            }
            (false, Some(_)) => {
                return Operand::Invalid(format!(
                    "filter '{}' does not take a subkey",
                    reference
                ))
            }
            _ => {}
        }

        Operand::Lazy(LazyOperand::new(
            reference.clone(),
            Arc::new(FilterResolver {
                provider,
                subkey: subkey.map(String::from),
                reference,
            }),
        ))
    }
}

// ── Lazy resolution against a provider ──────────────────────────────

struct FilterResolver {
    provider: Provider,
    subkey: Option<String>,
    reference: String,
}

impl FilterResolver {
    fn missing(&self) -> ScopeError {
        ScopeError::Evaluation(format!("filter '{}' returned no value", self.reference))
    }
}

#[async_trait]
impl ResolveOperand for FilterResolver {
    fn resolve(&self) -> Result<Operand, ScopeError> {
        match &self.provider {
            Provider::Value(p) => p.value().map(Operand::from).ok_or_else(|| self.missing()),
            Provider::Keyed(p) => {
                let key = self.subkey.as_deref().unwrap_or_default();
                p.value_for(key)
                    .map(Operand::from)
                    .ok_or_else(|| self.missing())
            }
            Provider::AsyncValue(_) | Provider::AsyncKeyed(_) => Err(ScopeError::Evaluation(
                format!(
                    "filter '{}' is async-backed and requires asynchronous evaluation",
                    self.reference
                ),
            )),
        }
    }

    async fn resolve_async(&self) -> Result<Operand, ScopeError> {
        match &self.provider {
            Provider::Value(_) | Provider::Keyed(_) => self.resolve(),
            Provider::AsyncValue(p) => {
                p.value().await.map(Operand::from).ok_or_else(|| self.missing())
            }
            Provider::AsyncKeyed(p) => {
                let key = self.subkey.as_deref().unwrap_or_default();
                p.value_for(key)
                    .await
                    .map(Operand::from)
                    .ok_or_else(|| self.missing())
            }
        }
    }
}

// ── Built-in Flight provider ────────────────────────────────────────

/// `Flight.<name>` — true when the named flight is enabled.
struct FlightFilter {
    flights: Arc<dyn FlightService>,
}

#[async_trait]
impl AsyncKeyedFilter for FlightFilter {
    async fn value_for(&self, key: &str) -> Option<FilterValue> {
        Some(FilterValue::Bool(self.flights.is_enabled_async(key).await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::StaticFlights;

    struct Fixed(FilterValue);

    impl ValueFilter for Fixed {
        fn value(&self) -> Option<FilterValue> {
            Some(self.0.clone())
        }
    }

    struct VersionParts;

    impl KeyedFilter for VersionParts {
        fn value_for(&self, key: &str) -> Option<FilterValue> {
            match key {
                "Major" => Some(FilterValue::Double(17.0)),
                "Minor" => Some(FilterValue::Double(4.0)),
                _ => None,
            }
        }
    }

    fn registry() -> FilterProviders {
        let mut providers = FilterProviders::new();
        providers.register_value("IsInternal", Arc::new(Fixed(FilterValue::Bool(true))));
        providers.register_keyed("Version", Arc::new(VersionParts));
        providers
    }

    #[test]
    fn bare_name_resolves_single_value_provider() {
        let operand = registry().resolve("IsInternal", None);
        match operand.force().unwrap() {
            Operand::Bool(b) => assert!(b),
            other => panic!("unexpected operand {:?}", other),
        }
    }

    #[test]
    fn subkey_resolves_keyed_provider() {
        let operand = registry().resolve("Version", Some("Major"));
        match operand.force().unwrap() {
            Operand::Double(d) => assert_eq!(d, 17.0),
            other => panic!("unexpected operand {:?}", other),
        }
    }

    #[test]
    fn shape_mismatch_is_invalid_not_error() {
        let registry = registry();
        assert!(matches!(
            registry.resolve("Version", None),
            Operand::Invalid(_)
        ));
        assert!(matches!(
            registry.resolve("IsInternal", Some("X")),
            Operand::Invalid(_)
        ));
        assert!(matches!(
            registry.resolve("Nope", None),
            Operand::Invalid(_)
        ));
    }

    #[test]
    fn provider_names_are_case_insensitive() {
        let operand = registry().resolve("isinternal", None);
        assert!(matches!(operand, Operand::Lazy(_)));
    }

    #[tokio::test]
    async fn flight_filter_consults_flight_service() {
        let mut providers = FilterProviders::new();
        providers.register_flights(Arc::new(StaticFlights::new(["Beta"])));

        let enabled = providers.resolve("Flight", Some("Beta"));
        match enabled.force_async().await.unwrap() {
            Operand::Bool(b) => assert!(b),
            other => panic!("unexpected operand {:?}", other),
        }

        // Async-backed provider refuses blocking resolution.
        let sync = providers.resolve("Flight", Some("Beta"));
        assert!(sync.force().is_err());
    }
}
