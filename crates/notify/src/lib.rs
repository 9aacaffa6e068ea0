//! Notification cache and courtesy engine for targeted actions.
//!
//! This crate provides:
//! - `ActionResponse` rule model with trigger declarations
//! - Cross-process-safe cache repository (advisory file lock, JSON file)
//! - Courtesy engine enforcing send-once and category cooldown semantics
//! - Trigger subscription manager wiring telemetry events to callbacks
//!
//! The engine's contract is conservative degradation: when the cache cannot
//! be locked or read, gated actions are withheld and a fault is reported —
//! a lost update or a double send is never risked.

pub mod action;
pub mod cache;
pub mod engine;
pub mod repository;
pub mod triggers;

pub use action::{parse_wait, ActionResponse, TriggerOptions};
pub use cache::{
    CachedActionCategoryTime, CachedActionResponseTime, CachedTargetedNotifications,
};
pub use engine::{Clock, CourtesyEngine, ManualClock, SendOutcome, SystemClock, DEFAULT_MAX_WAIT};
pub use repository::CacheRepository;
pub use triggers::{
    validate_trigger_config, TriggerCallback, TriggerManager, TriggerSpec,
    TriggerSubscriptionDetails, START_TRIGGER, STOP_TRIGGER,
};
