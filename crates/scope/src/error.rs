use thiserror::Error;

/// Errors from scope expression parsing, evaluation, and validation.
///
/// Callers of [`crate::ScopeEvaluator::evaluate`] never see these: any error
/// degrades to the denied sentinel (`false`) with a logged diagnostic. The
/// `try_*` entry points surface them for validation and tests.
#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid operand: {0}")]
    InvalidOperand(String),

    #[error("cannot compare {left} with {right}")]
    TypeMismatch {
        left: &'static str,
        right: &'static str,
    },

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("unknown scope '{0}'")]
    UnknownScope(String),

    #[error("scope reference cycle: {0}")]
    Cycle(String),

    #[error("scope reference depth exceeds {0}")]
    DepthExceeded(usize),
}
