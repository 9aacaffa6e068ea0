//! Shared types and collaborator boundaries for the beacon client.
//!
//! This crate provides:
//! - `SettingValue` tagged value type used across the settings pipeline
//! - `BeaconError` workspace-wide error enum
//! - `SettingsStore` key-value collection trait plus an in-memory backend
//! - Telemetry sink, fault reporting, and event-subscription traits
//! - `FlightService` and `SettingsReader` collaborator traits
//! - Env-based process configuration

pub mod config;
pub mod error;
pub mod flights;
pub mod reader;
pub mod storage;
pub mod telemetry;
pub mod value;

pub use config::Config;
pub use error::BeaconError;
pub use flights::{FlightService, StaticFlights};
pub use reader::{FileSettingsReader, SettingsReader};
pub use storage::{MemoryStore, SettingsStore, COLLECTION_SEPARATOR};
pub use telemetry::{
    activity, EventCallback, EventMatch, EventSubscriptionService, FaultSeverity, LocalEventBus,
    MemoryTelemetry, NullTelemetry, SubscriptionId, TelemetryEvent, TelemetrySink,
};
pub use value::SettingValue;
