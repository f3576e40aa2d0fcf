use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EntraflowError;
use crate::payload::Payload;

/// Comparison operators available to conditional edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Equals,
    NotEquals,
    LessThan,
    GreaterThan,
    Contains,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Equals => "==",
            CompareOp::NotEquals => "!=",
            CompareOp::LessThan => "<",
            CompareOp::GreaterThan => ">",
            CompareOp::Contains => "contains",
        }
    }
}

/// A predicate over one field of the source node's payload.
///
/// Written in workflow files as `field OP value`, for example
/// `sentiment.score < -0.5` or `label == "negative"`. The right-hand side is
/// parsed as JSON when possible and otherwise taken as a bare string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    pub value: serde_json::Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: CompareOp, value: serde_json::Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn equals(field: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(field, CompareOp::Equals, value)
    }

    pub fn less_than(field: impl Into<String>, value: f64) -> Self {
        Self::new(field, CompareOp::LessThan, serde_json::json!(value))
    }

    pub fn greater_than(field: impl Into<String>, value: f64) -> Self {
        Self::new(field, CompareOp::GreaterThan, serde_json::json!(value))
    }

    pub fn contains(field: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(field, CompareOp::Contains, value)
    }

    /// Evaluate against a payload. A missing field never matches.
    pub fn evaluate(&self, payload: &Payload) -> bool {
        let Some(actual) = payload.field(&self.field) else {
            return false;
        };
        match self.op {
            CompareOp::Equals => values_equal(actual, &self.value),
            CompareOp::NotEquals => !values_equal(actual, &self.value),
            CompareOp::LessThan => {
                compare(actual, &self.value).is_some_and(|o| o == std::cmp::Ordering::Less)
            }
            CompareOp::GreaterThan => {
                compare(actual, &self.value).is_some_and(|o| o == std::cmp::Ordering::Greater)
            }
            CompareOp::Contains => contains(actual, &self.value),
        }
    }
}

fn values_equal(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &serde_json::Value, b: &serde_json::Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &serde_json::Value, needle: &serde_json::Value) -> bool {
    match haystack {
        serde_json::Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        serde_json::Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        serde_json::Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

impl FromStr for Condition {
    type Err = EntraflowError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let expr = expr.trim();
        let Some((field, op, value)) = split_operator(expr)? else {
            return Err(EntraflowError::InvalidDefinition(format!(
                "Unsupported condition '{}': expected `field OP value` with OP one of ==, !=, <, >, contains",
                expr
            )));
        };

        if field.is_empty() || field.contains(char::is_whitespace) {
            return Err(EntraflowError::InvalidDefinition(format!(
                "Invalid condition field in '{}'",
                expr
            )));
        }
        if value.is_empty() {
            return Err(EntraflowError::InvalidDefinition(format!(
                "Missing comparison value in '{}'",
                expr
            )));
        }
        Ok(Condition::new(field, op, parse_literal(value)))
    }
}

/// Split `field OP value` at the leftmost operator, returning trimmed parts.
///
/// `<=` and `>=` are rejected rather than read as `<` against `"= ..."`.
fn split_operator(expr: &str) -> Result<Option<(&str, CompareOp, &str)>, EntraflowError> {
    for (i, c) in expr.char_indices() {
        let rest = &expr[i..];
        if rest.starts_with("<=") || rest.starts_with(">=") {
            return Err(EntraflowError::InvalidDefinition(format!(
                "Unsupported operator '{}' in '{}': use < or >",
                &rest[..2],
                expr
            )));
        }
        let (op, len) = if rest.starts_with("==") {
            (CompareOp::Equals, 2)
        } else if rest.starts_with("!=") {
            (CompareOp::NotEquals, 2)
        } else if c == '<' {
            (CompareOp::LessThan, 1)
        } else if c == '>' {
            (CompareOp::GreaterThan, 1)
        } else if rest.starts_with(" contains ") {
            (CompareOp::Contains, " contains ".len())
        } else {
            continue;
        };
        return Ok(Some((expr[..i].trim(), op, expr[i + len..].trim())));
    }
    Ok(None)
}

fn parse_literal(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

impl TryFrom<String> for Condition {
    type Error = EntraflowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Condition> for String {
    fn from(c: Condition) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.op.symbol(), self.value)
    }
}
