//! Flight/experiment service boundary.

use std::collections::HashSet;

use async_trait::async_trait;

/// Answers whether a named flight (experiment cohort) is enabled for this
/// installation. Backed by an experimentation service in production; scope
/// expressions consume it through the `Flight` filter provider.
#[async_trait]
pub trait FlightService: Send + Sync {
    /// Synchronous check against already-known flight state.
    fn is_enabled(&self, name: &str) -> bool;

    /// Asynchronous check that may consult a remote backend.
    async fn is_enabled_async(&self, name: &str) -> bool {
        self.is_enabled(name)
    }
}

/// Fixed flight membership, case-insensitive on flight name.
#[derive(Debug, Default)]
pub struct StaticFlights {
    enabled: HashSet<String>,
}

impl StaticFlights {
    pub fn new<I, S>(enabled: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: enabled
                .into_iter()
                .map(|s| s.into().to_ascii_lowercase())
                .collect(),
        }
    }
}

#[async_trait]
impl FlightService for StaticFlights {
    fn is_enabled(&self, name: &str) -> bool {
        self.enabled.contains(&name.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_flights_are_case_insensitive() {
        let flights = StaticFlights::new(["Beta"]);
        assert!(flights.is_enabled("beta"));
        assert!(flights.is_enabled("BETA"));
        assert!(!flights.is_enabled("stable"));
    }
}
