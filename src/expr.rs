//! Expression evaluator (C2).
//!
//! Evaluates predicate/binding strings against case data in three lexically
//! detected sub-languages: boolean literals, simple dotted paths, and a
//! path-comparison-literal triple. This is the in-tree fallback binding
//! evaluator collaborator (§6); a host may plug in a richer one as long as
//! it stays deterministic.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<String>,
}

impl EvalResult {
    fn ok(value: Value) -> Self {
        Self { success: true, value: Some(value), error: None }
    }

    fn err(error: impl Into<String>) -> Self {
        Self { success: false, value: None, error: Some(error.into()) }
    }
}

/// Target type for binding coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    String,
    Integer,
    Double,
    Boolean,
    Date,
}

/// Coercion strictness. `Strict` fails on any type mismatch; `Lenient`
/// attempts a best-effort conversion (e.g. numeric string to integer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    Strict,
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// Write keywords that have no business appearing in a read-only predicate
/// or binding expression. §4.5.2's "unsafe expression in a hook's query"
/// mitigation maps onto this evaluator rather than a separate hook query
/// language: this crate's hooks are plain handler closures (§4.11's design
/// notes), so the only string-shaped, potentially-unsafe expressions a host
/// ever hands the core are the ones evaluated here.
const WRITE_KEYWORDS: &[&str] = &["insert", "delete", "drop", "update", "alter", "create", "truncate", "replace"];

fn contains_write_keyword(expr: &str) -> bool {
    let lower = expr.to_lowercase();
    WRITE_KEYWORDS.iter().any(|kw| lower.split(|c: char| !c.is_alphanumeric()).any(|tok| tok == *kw))
}

/// Evaluate `expr` against `data`, returning a structured result.
pub fn evaluate(expr: &str, data: &Value) -> EvalResult {
    let trimmed = expr.trim();

    if contains_write_keyword(trimmed) {
        return EvalResult::err(format!("unsafe expression: contains a write keyword: {trimmed}"));
    }

    if let Some(b) = parse_bool_literal(trimmed) {
        return EvalResult::ok(Value::Bool(b));
    }

    if let Some((path, op, literal)) = parse_comparison(trimmed) {
        let lhs = resolve_path(data, path);
        let rhs = parse_literal(literal);
        return match (lhs, rhs) {
            (Some(lhs), Some(rhs)) => compare(&lhs, op, &rhs),
            (None, _) => EvalResult::err(format!("path not found: {path}")),
            (_, None) => EvalResult::err(format!("unparseable literal: {literal}")),
        };
    }

    // Simple path.
    match resolve_path(data, trimmed) {
        Some(v) => EvalResult::ok(v),
        None => EvalResult::err(format!("path not found: {trimmed}")),
    }
}

/// Boolean evaluation used for XOR/OR default branches: unrecognized or
/// failing expressions default to `true` rather than propagating an error.
pub fn evaluate_boolean(expr: &str, data: &Value) -> bool {
    let result = evaluate(expr, data);
    if !result.success {
        return true;
    }
    match result.value {
        Some(Value::Bool(b)) => b,
        Some(_) => true,
        None => true,
    }
}

/// Coerce `value` to `target`, honoring `strictness`.
pub fn coerce(value: &Value, target: TargetType, strictness: Strictness) -> Result<Value, String> {
    match (target, value) {
        (TargetType::String, Value::String(_)) => Ok(value.clone()),
        (TargetType::Boolean, Value::Bool(_)) => Ok(value.clone()),
        (TargetType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value.clone()),
        (TargetType::Double, Value::Number(_)) => Ok(value.clone()),
        (TargetType::Date, Value::String(s)) => {
            chrono::DateTime::parse_from_rfc3339(s)
                .map(|_| value.clone())
                .map_err(|e| format!("invalid date {s}: {e}"))
        }
        (_, _) if strictness == Strictness::Strict => {
            Err(format!("cannot coerce {value:?} to {target:?}"))
        }
        (TargetType::String, v) => Ok(Value::String(v.to_string())),
        (TargetType::Integer, Value::String(s)) => s
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|e| format!("cannot coerce {s:?} to integer: {e}")),
        (TargetType::Double, Value::String(s)) => s
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("cannot coerce {s:?} to double")),
        (TargetType::Boolean, Value::String(s)) => match s.to_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("cannot coerce {s:?} to boolean")),
        },
        (target, value) => Err(format!("cannot coerce {value:?} to {target:?}")),
    }
}

impl std::fmt::Debug for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TargetType::String => "string",
            TargetType::Integer => "integer",
            TargetType::Double => "double",
            TargetType::Boolean => "boolean",
            TargetType::Date => "date",
        };
        write!(f, "{s}")
    }
}

fn parse_bool_literal(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn parse_comparison(s: &str) -> Option<(&str, Op, &str)> {
    const OPS: &[(&str, Op)] = &[
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("!=", Op::Ne),
        ("=", Op::Eq),
        ("<", Op::Lt),
        (">", Op::Gt),
    ];
    for (token, op) in OPS {
        if let Some(idx) = s.find(token) {
            let lhs = s[..idx].trim();
            let rhs = s[idx + token.len()..].trim();
            if !lhs.is_empty() && !rhs.is_empty() && is_path(lhs) {
                return Some((lhs, *op, rhs));
            }
        }
    }
    None
}

fn is_path(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
        && s.chars().next().map(|c| c.is_alphabetic() || c == '_').unwrap_or(false)
}

fn parse_literal(s: &str) -> Option<Value> {
    let s = s.trim();
    if (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
        || (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
    {
        return Some(Value::String(s[1..s.len() - 1].to_string()));
    }
    if let Some(b) = parse_bool_literal(s) {
        return Some(Value::Bool(b));
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    if let Ok(f) = s.parse::<f64>() {
        return serde_json::Number::from_f64(f).map(Value::Number);
    }
    None
}

fn resolve_path<'a>(data: &'a Value, path: &str) -> Option<Value> {
    let mut current = data;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

fn compare(lhs: &Value, op: Op, rhs: &Value) -> EvalResult {
    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().and_then(|a| b.as_f64().map(|b| a.partial_cmp(&b))).flatten(),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };

    let Some(ordering) = ordering else {
        return EvalResult::err("mismatched comparison types");
    };

    use std::cmp::Ordering::*;
    let result = match op {
        Op::Eq => ordering == Equal,
        Op::Ne => ordering != Equal,
        Op::Lt => ordering == Less,
        Op::Gt => ordering == Greater,
        Op::Le => ordering != Greater,
        Op::Ge => ordering != Less,
    };
    EvalResult::ok(Value::Bool(result))
}
