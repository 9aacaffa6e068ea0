//! Evaluation operands.
//!
//! Operands are a tagged union over the value kinds a scope expression can
//! produce. Filter references become [`Operand::Lazy`] thunks that defer the
//! provider call until the value is actually forced, and memoize the result
//! so a filter is consulted at most once per expression evaluation. Parse
//! failures that only matter if reached (e.g. an unknown filter on a branch
//! that is never true) are carried as [`Operand::Invalid`] and raise when
//! forced, not when scanned.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::ScopeError;
use crate::operator::Operator;

/// Resolves a lazy operand, either blocking or suspending.
///
/// Synchronous providers implement both entry points identically; providers
/// that reach a remote backend return an error from `resolve` and do their
/// work in `resolve_async`.
#[async_trait]
pub trait ResolveOperand: Send + Sync {
    fn resolve(&self) -> Result<Operand, ScopeError>;

    async fn resolve_async(&self) -> Result<Operand, ScopeError>;
}

/// A deferred operand with memoized resolution.
#[derive(Clone)]
pub struct LazyOperand {
    /// The filter reference text, for diagnostics.
    reference: String,
    resolver: Arc<dyn ResolveOperand>,
    memo: Arc<Mutex<Option<Operand>>>,
}

impl LazyOperand {
    pub fn new(reference: impl Into<String>, resolver: Arc<dyn ResolveOperand>) -> Self {
        Self {
            reference: reference.into(),
            resolver,
            memo: Arc::new(Mutex::new(None)),
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    fn cached(&self) -> Option<Operand> {
        self.memo.lock().expect("lazy operand lock poisoned").clone()
    }

    fn store(&self, value: &Operand) {
        *self.memo.lock().expect("lazy operand lock poisoned") = Some(value.clone());
    }
}

/// A scope expression operand.
#[derive(Clone)]
pub enum Operand {
    Bool(bool),
    Double(f64),
    Str(String),
    Lazy(LazyOperand),
    /// Carries the reason the operand could not be formed; forcing it raises.
    Invalid(String),
}

impl Operand {
    /// Variant name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Operand::Bool(_) => "bool",
            Operand::Double(_) => "double",
            Operand::Str(_) => "string",
            Operand::Lazy(_) => "lazy",
            Operand::Invalid(_) => "invalid",
        }
    }

    /// Resolve to a concrete value, blocking on lazy thunks.
    pub fn force(&self) -> Result<Operand, ScopeError> {
        match self {
            Operand::Lazy(lazy) => {
                if let Some(value) = lazy.cached() {
                    return Ok(value);
                }
                let value = lazy.resolver.resolve()?.force()?;
                lazy.store(&value);
                Ok(value)
            }
            Operand::Invalid(reason) => Err(ScopeError::InvalidOperand(reason.clone())),
            other => Ok(other.clone()),
        }
    }

    /// Resolve to a concrete value, suspending on lazy thunks.
    pub async fn force_async(&self) -> Result<Operand, ScopeError> {
        let mut current = self.clone();
        loop {
            match current {
                Operand::Lazy(lazy) => {
                    if let Some(value) = lazy.cached() {
                        current = value;
                        continue;
                    }
                    let resolved = lazy.resolver.resolve_async().await?;
                    // Memoize only fully-resolved values.
                    match &resolved {
                        Operand::Lazy(_) => current = resolved,
                        value => {
                            lazy.store(value);
                            return Ok(value.clone());
                        }
                    }
                }
                Operand::Invalid(reason) => return Err(ScopeError::InvalidOperand(reason)),
                other => return Ok(other),
            }
        }
    }
}

// ── Resolved-operand semantics (shared by both evaluators) ──────────

/// Boolean coercion of an already-forced operand.
pub fn coerce_bool(operand: &Operand) -> Result<bool, ScopeError> {
    match operand {
        Operand::Bool(b) => Ok(*b),
        Operand::Double(d) => Ok(*d != 0.0),
        Operand::Str(s) => Ok(!s.is_empty()),
        Operand::Lazy(lazy) => Err(ScopeError::Evaluation(format!(
            "unforced lazy operand '{}'",
            lazy.reference()
        ))),
        Operand::Invalid(reason) => Err(ScopeError::InvalidOperand(reason.clone())),
    }
}

/// Comparison of two already-forced operands.
///
/// Operands compare only against same-tagged operands; ordering operators
/// apply to doubles only, equality to any same-tag pair.
pub fn compare(op: Operator, left: &Operand, right: &Operand) -> Result<bool, ScopeError> {
    match (left, right) {
        (Operand::Bool(a), Operand::Bool(b)) => match op {
            Operator::Eq => Ok(a == b),
            Operator::Ne => Ok(a != b),
            _ => Err(ScopeError::Evaluation(format!(
                "operator '{}' is not defined for bool operands",
                op
            ))),
        },
        (Operand::Double(a), Operand::Double(b)) => Ok(match op {
            Operator::Eq => a == b,
            Operator::Ne => a != b,
            Operator::Gt => a > b,
            Operator::Lt => a < b,
            Operator::Ge => a >= b,
            Operator::Le => a <= b,
            _ => {
                return Err(ScopeError::Evaluation(format!(
                    "operator '{}' is not a comparison",
                    op
                )))
            }
        }),
        (Operand::Str(a), Operand::Str(b)) => match op {
            Operator::Eq => Ok(a == b),
            Operator::Ne => Ok(a != b),
            _ => Err(ScopeError::Evaluation(format!(
                "operator '{}' is not defined for string operands",
                op
            ))),
        },
        (l, r) => Err(ScopeError::TypeMismatch {
            left: l.kind(),
            right: r.kind(),
        }),
    }
}

impl fmt::Debug for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Bool(b) => write!(f, "Bool({})", b),
            Operand::Double(d) => write!(f, "Double({})", d),
            Operand::Str(s) => write!(f, "Str({:?})", s),
            Operand::Lazy(lazy) => write!(f, "Lazy({})", lazy.reference()),
            Operand::Invalid(reason) => write!(f, "Invalid({})", reason),
        }
    }
}
