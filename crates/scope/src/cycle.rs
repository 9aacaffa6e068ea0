//! Named-scope cycle detection.
//!
//! Scopes may reference other scopes via `Scope.<name>` tokens, forming a
//! directed graph that must be acyclic before the table is trusted. Runs
//! after parsing any freshly downloaded scope table and as a standing check
//! against the persisted one; a cycle rejects the whole document.

use std::collections::HashMap;

use crate::error::ScopeError;

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validate that a named-scope table contains no reference cycles.
///
/// Three-color depth-first search, O(V+E); returns on the first back-edge
/// found, with the offending chain in the error. References to scopes not
/// present in the table are not edges — they fail at evaluation time, which
/// is a per-expression concern, not a table-integrity one.
pub fn validate_scopes(scopes: &HashMap<String, String>) -> Result<(), ScopeError> {
    let graph: HashMap<String, Vec<String>> = scopes
        .iter()
        .map(|(name, expr)| (name.to_ascii_lowercase(), scope_references(expr)))
        .collect();

    let mut colors: HashMap<&str, Color> =
        graph.keys().map(|name| (name.as_str(), Color::White)).collect();

    for name in graph.keys() {
        if colors[name.as_str()] == Color::White {
            let mut path = Vec::new();
            visit(name, &graph, &mut colors, &mut path)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    name: &'a str,
    graph: &'a HashMap<String, Vec<String>>,
    colors: &mut HashMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Result<(), ScopeError> {
    colors.insert(name, Color::Gray);
    path.push(name);

    if let Some(references) = graph.get(name) {
        for reference in references {
            let Some((key, _)) = graph.get_key_value(reference) else {
                continue;
            };
            match colors[key.as_str()] {
                Color::Gray => {
                    // Back-edge: report the chain from the first occurrence.
                    let start = path.iter().position(|n| *n == key.as_str()).unwrap_or(0);
                    let mut chain: Vec<&str> = path[start..].to_vec();
                    chain.push(key);
                    return Err(ScopeError::Cycle(chain.join(" -> ")));
                }
                Color::White => visit(key, graph, colors, path)?,
                Color::Black => {}
            }
        }
    }

    path.pop();
    colors.insert(name, Color::Black);
    Ok(())
}

/// Scope names referenced by an expression, lowercased.
///
/// Scans identifier runs outside quoted strings; `Scope.X` inside a string
/// literal is text, not a reference.
pub fn scope_references(expression: &str) -> Vec<String> {
    let mut references = Vec::new();
    let mut rest = expression;

    while let Some(c) = rest.chars().next() {
        if c == '\'' {
            // Skip the quoted literal; an unterminated quote ends the scan.
            match rest[1..].find('\'') {
                Some(end) => rest = &rest[end + 2..],
                None => break,
            }
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            let end = rest
                .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '.' || ch == '_'))
                .unwrap_or(rest.len());
            let word = &rest[..end];
            if let Some((head, tail)) = word.split_once('.') {
                if head.eq_ignore_ascii_case("scope") && !tail.is_empty() {
                    references.push(tail.to_ascii_lowercase());
                }
            }
            rest = &rest[end..];
            continue;
        }
        rest = &rest[c.len_utf8()..];
    }

    references
}
