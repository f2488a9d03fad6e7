//! String-level composition of selection and weight expressions.
//!
//! An empty expression means "no constraint" (all events) for selections and
//! "unit weight" for weights, so combining with an empty operand returns the
//! other operand unchanged.

use std::collections::BTreeSet;

use hc_core::Result;

use crate::expr::CompiledExpr;

/// Fields referenced by `expression` (empty for an empty expression).
pub fn fields(expression: &str) -> Result<BTreeSet<String>> {
    if expression.trim().is_empty() {
        return Ok(BTreeSet::new());
    }
    Ok(CompiledExpr::compile(expression)?.fields.into_iter().collect())
}

fn binary(a: &str, op: &str, b: &str) -> String {
    match (a.trim(), b.trim()) {
        ("", b) => b.to_string(),
        (a, "") => a.to_string(),
        (a, b) => format!("({a}) {op} ({b})"),
    }
}

/// Logical negation. The negation of an empty selection stays empty.
pub fn negated(expression: &str) -> String {
    match expression.trim() {
        "" => String::new(),
        e => format!("!({e})"),
    }
}

/// Negate every standalone use of the field `variable` (function names and
/// longer identifiers are left alone).
pub fn variable_negated(expression: &str, variable: &str) -> String {
    let bytes = expression.as_bytes();
    let mut out = String::with_capacity(expression.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if !(c.is_ascii_alphabetic() || c == b'_') {
            // Numbers such as `1e5` must not start an identifier.
            let start = i;
            i += expression[i..].chars().next().map_or(1, char::len_utf8);
            if c.is_ascii_digit() || c == b'.' {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                    i += 1;
                }
            }
            out.push_str(&expression[start..i]);
            continue;
        }
        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
            i += 1;
        }
        let ident = &expression[start..i];
        let is_call = expression[i..].trim_start().starts_with('(');
        if ident == variable && !is_call {
            out.push_str(&format!("!({ident})"));
        } else {
            out.push_str(ident);
        }
    }
    out
}

/// Rewrite alternative operator spellings to the canonical ones
/// (`&` → `&&`, `|` → `||`, `~` → `!`).
pub fn normalized(expression: &str) -> String {
    let mut out = String::with_capacity(expression.len() + 8);
    let mut chars = expression.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '&' | '|' => {
                out.push(c);
                out.push(c);
                if chars.peek() == Some(&c) {
                    chars.next();
                }
            }
            '~' => out.push('!'),
            other => out.push(other),
        }
    }
    out
}

/// Logical AND of all operands.
pub fn anded<'a>(expressions: impl IntoIterator<Item = &'a str>) -> String {
    expressions.into_iter().fold(String::new(), |acc, e| binary(&acc, "&&", e))
}

/// Logical OR of all operands.
pub fn ored<'a>(expressions: impl IntoIterator<Item = &'a str>) -> String {
    expressions.into_iter().fold(String::new(), |acc, e| binary(&acc, "||", e))
}

/// Arithmetic sum of all operands.
pub fn added<'a>(expressions: impl IntoIterator<Item = &'a str>) -> String {
    expressions.into_iter().fold(String::new(), |acc, e| binary(&acc, "+", e))
}

/// Product of all operands (weights multiply).
pub fn multiplied<'a>(expressions: impl IntoIterator<Item = &'a str>) -> String {
    expressions.into_iter().fold(String::new(), |acc, e| binary(&acc, "*", e))
}

/// `a - b`.
pub fn subtracted(a: &str, b: &str) -> String {
    match (a.trim(), b.trim()) {
        (a, "") => a.to_string(),
        ("", b) => format!("-({b})"),
        (a, b) => format!("({a}) - ({b})"),
    }
}

/// Logical exclusive OR: true when exactly one operand is true.
pub fn xored(a: &str, b: &str) -> String {
    match (a.trim(), b.trim()) {
        ("", "") => "0".to_string(),
        ("", b) => negated(b),
        (a, "") => negated(a),
        (a, b) => format!("(({a}) > 0) != (({b}) > 0)"),
    }
}

/// `floor(a / b)`.
pub fn floor_divided(a: &str, b: &str) -> String {
    match divided(a, b).as_str() {
        "" => String::new(),
        q => format!("floor({q})"),
    }
}

/// `a / b`.
pub fn divided(a: &str, b: &str) -> String {
    match (a.trim(), b.trim()) {
        (a, "") => a.to_string(),
        ("", b) => format!("1 / ({b})"),
        (a, b) => format!("({a}) / ({b})"),
    }
}
