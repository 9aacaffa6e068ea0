//! Scope expression tokenizer and evaluators.
//!
//! One tokenizer and one shunting-yard pass produce an RPN program; the
//! synchronous and asynchronous evaluators run the same program and share
//! all operator semantics, differing only in how lazy operands are forced.
//! A filter backed by a remote service therefore suspends under the async
//! evaluator instead of blocking a carrier thread, and both evaluators are
//! guaranteed to agree on every expression.
//!
//! Any parse or evaluation error degrades to the denied sentinel (`false`)
//! with a logged diagnostic; callers never see an error from the plain
//! `evaluate` entry points.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::ScopeError;
use crate::filters::FilterProviders;
use crate::operand::{coerce_bool, compare, LazyOperand, Operand, ResolveOperand};
use crate::operator::{Fixity, Operator};

/// Named-scope references may nest (`Scope.A` → `Scope.B` → …). The cycle
/// detector rejects cyclic tables before they are trusted; this cap bounds
/// legitimate chains and stops runaway recursion on unvalidated input.
pub(crate) const MAX_SCOPE_DEPTH: usize = 10;

// ── Tokens ──────────────────────────────────────────────────────────

enum Token {
    Operand(Operand),
    Op(Operator),
    LParen,
    RParen,
}

enum RpnItem {
    Operand(Operand),
    Op(Operator),
}

fn is_operand_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_'
}

// ── Evaluator ───────────────────────────────────────────────────────

pub(crate) struct EvalContext {
    providers: FilterProviders,
    /// Named-scope table, keyed by lowercased scope name.
    scopes: HashMap<String, String>,
}

/// Evaluates scope expressions against a filter-provider registry and an
/// optional named-scope table.
#[derive(Clone)]
pub struct ScopeEvaluator {
    ctx: Arc<EvalContext>,
}

impl ScopeEvaluator {
    pub fn new(providers: FilterProviders) -> Self {
        Self::with_scopes(providers, HashMap::new())
    }

    /// Build an evaluator with a named-scope table. The table must already
    /// have passed cycle validation (`crate::cycle::validate_scopes`).
    pub fn with_scopes(providers: FilterProviders, scopes: HashMap<String, String>) -> Self {
        let scopes = scopes
            .into_iter()
            .map(|(name, expr)| (name.to_ascii_lowercase(), expr))
            .collect();
        Self {
            ctx: Arc::new(EvalContext { providers, scopes }),
        }
    }

    /// Evaluate synchronously; errors deny the expression.
    pub fn evaluate(&self, expression: &str) -> bool {
        match self.try_evaluate(expression) {
            Ok(result) => result,
            Err(e) => {
                warn!(expression, error = %e, "scope expression denied");
                false
            }
        }
    }

    /// Evaluate asynchronously; errors deny the expression.
    pub async fn evaluate_async(&self, expression: &str) -> bool {
        match self.try_evaluate_async(expression).await {
            Ok(result) => result,
            Err(e) => {
                warn!(expression, error = %e, "scope expression denied");
                false
            }
        }
    }

    /// Evaluate synchronously, surfacing the error.
    pub fn try_evaluate(&self, expression: &str) -> Result<bool, ScopeError> {
        eval_sync(&self.ctx, expression, 0)
    }

    /// Evaluate asynchronously, surfacing the error.
    pub async fn try_evaluate_async(&self, expression: &str) -> Result<bool, ScopeError> {
        eval_async(self.ctx.clone(), expression.to_string(), 0).await
    }
}

// ── Tokenizer ───────────────────────────────────────────────────────

fn tokenize(ctx: &Arc<EvalContext>, expr: &str, depth: usize) -> Result<Vec<Token>, ScopeError> {
    let mut tokens = Vec::new();
    let mut rest = expr;

    while let Some(c) = rest.chars().next() {
        if c.is_whitespace() {
            rest = &rest[c.len_utf8()..];
            continue;
        }
        if c == '(' {
            tokens.push(Token::LParen);
            rest = &rest[1..];
            continue;
        }
        if c == ')' {
            tokens.push(Token::RParen);
            rest = &rest[1..];
            continue;
        }
        if let Some((op, len)) = Operator::scan(rest) {
            tokens.push(Token::Op(op));
            rest = &rest[len..];
            continue;
        }
        if c == '\'' {
            let body = &rest[1..];
            let end = body
                .find('\'')
                .ok_or_else(|| ScopeError::Parse(format!("unterminated string in '{}'", expr)))?;
            tokens.push(Token::Operand(Operand::Str(body[..end].to_string())));
            rest = &body[end + 1..];
            continue;
        }
        if is_operand_char(c) {
            let end = rest
                .find(|ch| !is_operand_char(ch))
                .unwrap_or(rest.len());
            let word = &rest[..end];
            tokens.push(Token::Operand(scan_operand(ctx, word, depth)));
            rest = &rest[end..];
            continue;
        }

        return Err(ScopeError::Parse(format!(
            "unexpected character '{}' in '{}'",
            c, expr
        )));
    }

    if tokens.is_empty() {
        return Err(ScopeError::Parse("empty expression".to_string()));
    }
    Ok(tokens)
}

/// Operand scanning order: double literal first, then filter reference.
/// (Quoted strings are consumed directly by the tokenizer.)
fn scan_operand(ctx: &Arc<EvalContext>, word: &str, depth: usize) -> Operand {
    if let Ok(d) = word.parse::<f64>() {
        return Operand::Double(d);
    }

    let (name, subkey) = match word.split_once('.') {
        Some((name, subkey)) => (name, Some(subkey)),
        None => (word, None),
    };

    if name.eq_ignore_ascii_case("scope") {
        return match subkey {
            Some(scope_name) if !scope_name.is_empty() => Operand::Lazy(LazyOperand::new(
                word,
                Arc::new(ScopeRefResolver {
                    ctx: ctx.clone(),
                    scope_name: scope_name.to_string(),
                    depth,
                }),
            )),
            _ => Operand::Invalid("scope reference requires a name".to_string()),
        };
    }

    ctx.providers.resolve(name, subkey)
}

// ── Shunting-yard ───────────────────────────────────────────────────

fn to_rpn(tokens: Vec<Token>) -> Result<Vec<RpnItem>, ScopeError> {
    let mut output: Vec<RpnItem> = Vec::new();
    let mut ops: Vec<Operator> = Vec::new();

    for token in tokens {
        match token {
            Token::Operand(operand) => output.push(RpnItem::Operand(operand)),
            Token::Op(op) => {
                while let Some(&top) = ops.last() {
                    let pops = match op.fixity() {
                        Fixity::Left => top.priority() >= op.priority(),
                        Fixity::Right => top.priority() > op.priority(),
                    };
                    if !pops {
                        break;
                    }
                    ops.pop();
                    output.push(RpnItem::Op(top));
                }
                ops.push(op);
            }
            Token::LParen => ops.push(Operator::Sentinel),
            Token::RParen => loop {
                match ops.pop() {
                    Some(Operator::Sentinel) => break,
                    Some(op) => output.push(RpnItem::Op(op)),
                    None => {
                        return Err(ScopeError::Parse("unbalanced ')'".to_string()));
                    }
                }
            },
        }
    }

    while let Some(op) = ops.pop() {
        if op == Operator::Sentinel {
            return Err(ScopeError::Parse("unbalanced '('".to_string()));
        }
        output.push(RpnItem::Op(op));
    }

    Ok(output)
}

// ── Shared operator application ─────────────────────────────────────

fn apply_unary(op: Operator, operand: &Operand) -> Result<Operand, ScopeError> {
    match op {
        Operator::Not => Ok(Operand::Bool(!coerce_bool(operand)?)),
        other => Err(ScopeError::Parse(format!(
            "operator '{}' is not unary",
            other
        ))),
    }
}

fn apply_binary(op: Operator, left: &Operand, right: &Operand) -> Result<Operand, ScopeError> {
    match op {
        Operator::And => Ok(Operand::Bool(coerce_bool(left)? && coerce_bool(right)?)),
        Operator::Or => Ok(Operand::Bool(coerce_bool(left)? || coerce_bool(right)?)),
        Operator::Eq
        | Operator::Ne
        | Operator::Gt
        | Operator::Lt
        | Operator::Ge
        | Operator::Le => Ok(Operand::Bool(compare(op, left, right)?)),
        other => Err(ScopeError::Parse(format!(
            "operator '{}' is not binary",
            other
        ))),
    }
}

fn pop_operand(stack: &mut Vec<Operand>) -> Result<Operand, ScopeError> {
    stack
        .pop()
        .ok_or_else(|| ScopeError::Parse("malformed expression".to_string()))
}

// ── Evaluation runners ──────────────────────────────────────────────

fn eval_sync(ctx: &Arc<EvalContext>, expr: &str, depth: usize) -> Result<bool, ScopeError> {
    let rpn = to_rpn(tokenize(ctx, expr, depth)?)?;
    let mut stack: Vec<Operand> = Vec::new();

    for item in &rpn {
        match item {
            RpnItem::Operand(operand) => stack.push(operand.clone()),
            RpnItem::Op(op) => {
                let result = if op.arity() == 1 {
                    let operand = pop_operand(&mut stack)?.force()?;
                    apply_unary(*op, &operand)?
                } else {
                    let right = pop_operand(&mut stack)?.force()?;
                    let left = pop_operand(&mut stack)?.force()?;
                    apply_binary(*op, &left, &right)?
                };
                stack.push(result);
            }
        }
    }

    if stack.len() != 1 {
        return Err(ScopeError::Parse("malformed expression".to_string()));
    }
    coerce_bool(&pop_operand(&mut stack)?.force()?)
}

async fn eval_async(
    ctx: Arc<EvalContext>,
    expr: String,
    depth: usize,
) -> Result<bool, ScopeError> {
    let rpn = to_rpn(tokenize(&ctx, &expr, depth)?)?;
    let mut stack: Vec<Operand> = Vec::new();

    for item in &rpn {
        match item {
            RpnItem::Operand(operand) => stack.push(operand.clone()),
            RpnItem::Op(op) => {
                let result = if op.arity() == 1 {
                    let operand = pop_operand(&mut stack)?.force_async().await?;
                    apply_unary(*op, &operand)?
                } else {
                    let right = pop_operand(&mut stack)?.force_async().await?;
                    let left = pop_operand(&mut stack)?.force_async().await?;
                    apply_binary(*op, &left, &right)?
                };
                stack.push(result);
            }
        }
    }

    if stack.len() != 1 {
        return Err(ScopeError::Parse("malformed expression".to_string()));
    }
    coerce_bool(&pop_operand(&mut stack)?.force_async().await?)
}

// ── Named-scope references ──────────────────────────────────────────

/// `Scope.<name>` — evaluates the named scope's own expression.
struct ScopeRefResolver {
    ctx: Arc<EvalContext>,
    scope_name: String,
    depth: usize,
}

impl ScopeRefResolver {
    fn expression(&self) -> Result<String, ScopeError> {
        if self.depth + 1 > MAX_SCOPE_DEPTH {
            return Err(ScopeError::DepthExceeded(MAX_SCOPE_DEPTH));
        }
        self.ctx
            .scopes
            .get(&self.scope_name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ScopeError::UnknownScope(self.scope_name.clone()))
    }
}

#[async_trait]
impl ResolveOperand for ScopeRefResolver {
    fn resolve(&self) -> Result<Operand, ScopeError> {
        let expr = self.expression()?;
        Ok(Operand::Bool(eval_sync(&self.ctx, &expr, self.depth + 1)?))
    }

    async fn resolve_async(&self) -> Result<Operand, ScopeError> {
        let expr = self.expression()?;
        Ok(Operand::Bool(
            eval_async(self.ctx.clone(), expr, self.depth + 1).await?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{AsyncValueFilter, FilterValue, ValueFilter};
    use beacon_core::StaticFlights;

    struct Flag(bool);

    impl ValueFilter for Flag {
        fn value(&self) -> Option<FilterValue> {
            Some(FilterValue::Bool(self.0))
        }
    }

    struct AsyncFlag(bool);

    #[async_trait]
    impl AsyncValueFilter for AsyncFlag {
        async fn value(&self) -> Option<FilterValue> {
            Some(FilterValue::Bool(self.0))
        }
    }

    struct Num(f64);

    impl ValueFilter for Num {
        fn value(&self) -> Option<FilterValue> {
            Some(FilterValue::Double(self.0))
        }
    }

    struct Text(&'static str);

    impl ValueFilter for Text {
        fn value(&self) -> Option<FilterValue> {
            Some(FilterValue::Str(self.0.to_string()))
        }
    }

    fn flags(a: bool, b: bool, c: bool) -> ScopeEvaluator {
        let mut providers = FilterProviders::new();
        providers.register_value("a", Arc::new(Flag(a)));
        providers.register_value("b", Arc::new(Flag(b)));
        providers.register_value("c", Arc::new(Flag(c)));
        ScopeEvaluator::new(providers)
    }

    #[test]
    fn literal_comparisons() {
        let eval = ScopeEvaluator::new(FilterProviders::new());
        assert!(eval.evaluate("1 == 1"));
        assert!(eval.evaluate("2 > 1"));
        assert!(eval.evaluate("1.5 <= 1.5"));
        assert!(!eval.evaluate("3 != 3"));
        assert!(eval.evaluate("'en-US' == 'en-US'"));
        assert!(!eval.evaluate("'en-US' == 'de-DE'"));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // "a || b && c" must evaluate as a || (b && c) for every substitution.
        for bits in 0..8u8 {
            let (a, b, c) = (bits & 4 != 0, bits & 2 != 0, bits & 1 != 0);
            let expected = a || (b && c);
            assert_eq!(
                flags(a, b, c).evaluate("a || b && c"),
                expected,
                "a={} b={} c={}",
                a,
                b,
                c
            );
        }
    }

    #[test]
    fn parentheses_override_priority() {
        assert!(!flags(true, false, false).evaluate("(a || b) && c"));
        assert!(flags(true, false, false).evaluate("a || b && c"));
    }

    #[test]
    fn not_applies_before_binary_operators() {
        assert!(flags(false, false, false).evaluate("!a"));
        assert!(!flags(true, false, false).evaluate("!a || b"));
        assert!(flags(false, true, true).evaluate("!a && b"));
        assert!(flags(true, false, false).evaluate("!!a"));
    }

    #[test]
    fn comparison_against_filter_value() {
        let mut providers = FilterProviders::new();
        providers.register_value("BuildNumber", Arc::new(Num(17.0)));
        providers.register_value("Culture", Arc::new(Text("en-US")));
        let eval = ScopeEvaluator::new(providers);

        assert!(eval.evaluate("BuildNumber >= 17"));
        assert!(!eval.evaluate("BuildNumber < 17"));
        assert!(eval.evaluate("Culture == 'en-US'"));
        assert!(eval.evaluate("BuildNumber >= 16 && Culture != 'de-DE'"));
    }

    #[test]
    fn errors_deny_instead_of_propagating() {
        let eval = ScopeEvaluator::new(FilterProviders::new());
        // Unknown filter, type mismatch, parse garbage: all false.
        assert!(!eval.evaluate("UnknownFilter"));
        assert!(!eval.evaluate("1 == 'one'"));
        assert!(!eval.evaluate("1 =="));
        assert!(!eval.evaluate("((1 == 1)"));
        assert!(!eval.evaluate(""));
    }

    #[test]
    fn unknown_filter_is_scan_tolerant() {
        // Scanning succeeds; the failure surfaces at evaluation time.
        let eval = ScopeEvaluator::new(FilterProviders::new());
        let err = eval.try_evaluate("Unknown == 1").unwrap_err();
        assert!(matches!(err, ScopeError::InvalidOperand(_)));
    }

    #[tokio::test]
    async fn sync_and_async_agree() {
        let cases = [
            "a || b && c",
            "!a && (b || c)",
            "a == b",
            "1 < 2 && c",
            "!(a && b) || c",
        ];
        for bits in 0..8u8 {
            let (a, b, c) = (bits & 4 != 0, bits & 2 != 0, bits & 1 != 0);
            let eval = flags(a, b, c);
            for expr in cases {
                assert_eq!(
                    eval.try_evaluate(expr).unwrap(),
                    eval.try_evaluate_async(expr).await.unwrap(),
                    "{} with a={} b={} c={}",
                    expr,
                    a,
                    b,
                    c
                );
            }
        }
    }

    #[tokio::test]
    async fn async_provider_matches_sync_provider_results() {
        for value in [true, false] {
            let mut sync_providers = FilterProviders::new();
            sync_providers.register_value("f", Arc::new(Flag(value)));
            let sync_eval = ScopeEvaluator::new(sync_providers);

            let mut async_providers = FilterProviders::new();
            async_providers.register_async_value("f", Arc::new(AsyncFlag(value)));
            let async_eval = ScopeEvaluator::new(async_providers);

            assert_eq!(
                sync_eval.try_evaluate("f && 1 == 1").unwrap(),
                async_eval.try_evaluate_async("f && 1 == 1").await.unwrap()
            );
        }
    }

    #[tokio::test]
    async fn async_backed_filter_denies_blocking_evaluation() {
        let mut providers = FilterProviders::new();
        providers.register_async_value("remote", Arc::new(AsyncFlag(true)));
        let eval = ScopeEvaluator::new(providers);

        assert!(!eval.evaluate("remote"));
        assert!(eval.evaluate_async("remote").await);
    }

    #[tokio::test]
    async fn scope_references_recurse_through_the_table() {
        let mut providers = FilterProviders::new();
        providers.register_flights(Arc::new(StaticFlights::new(["Beta"])));
        let scopes = HashMap::from([
            ("IsBeta".to_string(), "Flight.Beta".to_string()),
            ("BetaAndModern".to_string(), "Scope.IsBeta && 1 == 1".to_string()),
        ]);
        let eval = ScopeEvaluator::with_scopes(providers, scopes);

        assert!(eval.evaluate_async("Scope.IsBeta").await);
        assert!(eval.evaluate_async("Scope.BetaAndModern").await);
        assert!(!eval.evaluate_async("Scope.Missing").await);
    }

    #[test]
    fn runaway_scope_depth_is_denied() {
        // Self-reference is normally rejected by the cycle detector before an
        // evaluator is built; the depth cap keeps unvalidated input finite.
        let scopes = HashMap::from([("Loop".to_string(), "Scope.Loop".to_string())]);
        let eval = ScopeEvaluator::with_scopes(FilterProviders::new(), scopes);
        assert!(!eval.evaluate("Scope.Loop"));
    }
}
