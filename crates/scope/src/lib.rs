//! Scope expression engine.
//!
//! This crate provides:
//! - Infix boolean/comparison expression grammar over filter references
//! - Single-pass shunting-yard evaluation, synchronous and asynchronous
//! - Filter provider registry ({single,multi}-value × {sync,async})
//! - Named-scope table support (`Scope.<name>` references)
//! - Cycle detection for named-scope tables
//!
//! Evaluation is deny-on-error: a malformed expression or failing filter
//! makes the expression false and logs a diagnostic, so one bad rule cannot
//! break unrelated lookups.

pub mod cycle;
pub mod error;
pub mod eval;
pub mod filters;
pub mod operand;
pub mod operator;

pub use cycle::{scope_references, validate_scopes};
pub use error::ScopeError;
pub use eval::ScopeEvaluator;
pub use filters::{
    AsyncKeyedFilter, AsyncValueFilter, FilterProviders, FilterValue, KeyedFilter, ValueFilter,
};
pub use operand::{LazyOperand, Operand, ResolveOperand};
pub use operator::{Fixity, Operator};
