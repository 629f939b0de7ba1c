use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate};
use serde_json::Value;
use thiserror::Error;

use crate::types::Row;

/// Comparison operator understood by [`Filter::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    ILike,
    In,
    Is,
}

impl Operator {
    pub fn parse(value: &str) -> Option<Self> {
        let op = match value {
            "eq" => Self::Eq,
            "neq" => Self::Neq,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "like" => Self::Like,
            "ilike" => Self::ILike,
            "in" => Self::In,
            "is" => Self::Is,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Like => "like",
            Self::ILike => "ilike",
            Self::In => "in",
            Self::Is => "is",
        }
    }
}

/// Row predicate evaluated by the query builder.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare {
        column: String,
        op: Operator,
        value: Value,
    },
    Not(Box<Filter>),
    Or(Vec<Filter>),
    And(Vec<Filter>),
}

impl Filter {
    pub fn compare(column: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::Compare { column, op, value } => {
                let actual = row.get(column).unwrap_or(&Value::Null);
                compare_op(actual, *op, value)
            }
            Self::Not(inner) => !inner.matches(row),
            Self::Or(filters) => filters.iter().any(|filter| filter.matches(row)),
            Self::And(filters) => filters.iter().all(|filter| filter.matches(row)),
        }
    }

    /// Parses a PostgREST style logic expression such as
    /// `status.eq.applied,company_name.ilike.%acme%`.
    pub fn parse_or(expression: &str) -> Result<Self, FilterParseError> {
        let parts = split_top_level(expression)?;
        if parts.is_empty() {
            return Err(FilterParseError::Empty);
        }
        let filters = parts
            .into_iter()
            .map(parse_condition)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::Or(filters))
    }
}

/// Errors produced while parsing textual filter expressions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterParseError {
    #[error("filter expression is empty")]
    Empty,
    #[error("unbalanced parentheses in filter expression")]
    Unbalanced,
    #[error("malformed condition '{0}'")]
    Malformed(String),
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
}

fn split_top_level(expression: &str) -> Result<Vec<&str>, FilterParseError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in expression.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or(FilterParseError::Unbalanced)?,
            ',' if depth == 0 => {
                parts.push(expression[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(FilterParseError::Unbalanced);
    }
    parts.push(expression[start..].trim());
    Ok(parts.into_iter().filter(|part| !part.is_empty()).collect())
}

fn parse_condition(condition: &str) -> Result<Filter, FilterParseError> {
    for (prefix, negated) in [("and(", false), ("or(", false), ("not.and(", true), ("not.or(", true)] {
        if let Some(inner) = condition.strip_prefix(prefix) {
            let inner = inner
                .strip_suffix(')')
                .ok_or(FilterParseError::Unbalanced)?;
            let filters = split_top_level(inner)?
                .into_iter()
                .map(parse_condition)
                .collect::<Result<Vec<_>, _>>()?;
            let group = if prefix.ends_with("and(") {
                Filter::And(filters)
            } else {
                Filter::Or(filters)
            };
            return Ok(if negated {
                Filter::Not(Box::new(group))
            } else {
                group
            });
        }
    }

    let (column, rest) = condition
        .split_once('.')
        .ok_or_else(|| FilterParseError::Malformed(condition.to_string()))?;
    if column.is_empty() {
        return Err(FilterParseError::Malformed(condition.to_string()));
    }
    let (negated, rest) = match rest.strip_prefix("not.") {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    let (op_raw, raw_value) = rest
        .split_once('.')
        .ok_or_else(|| FilterParseError::Malformed(condition.to_string()))?;
    let op = Operator::parse(op_raw)
        .ok_or_else(|| FilterParseError::UnknownOperator(op_raw.to_string()))?;
    let value = parse_value(op, raw_value)?;
    let filter = Filter::compare(column, op, value);
    Ok(if negated {
        Filter::Not(Box::new(filter))
    } else {
        filter
    })
}

/// Converts the textual value of a condition into JSON.
pub fn parse_value(op: Operator, raw: &str) -> Result<Value, FilterParseError> {
    match op {
        Operator::In => {
            let inner = raw
                .strip_prefix('(')
                .and_then(|value| value.strip_suffix(')'))
                .ok_or_else(|| FilterParseError::Malformed(raw.to_string()))?;
            Ok(Value::Array(
                inner
                    .split(',')
                    .map(|item| Value::String(item.trim().trim_matches('"').to_string()))
                    .collect(),
            ))
        }
        Operator::Is => match raw {
            "null" => Ok(Value::Null),
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            other => Err(FilterParseError::Malformed(other.to_string())),
        },
        _ => Ok(Value::String(raw.trim_matches('"').to_string())),
    }
}

fn compare_op(actual: &Value, op: Operator, expected: &Value) -> bool {
    match op {
        Operator::Eq => compare_values(actual, expected) == Some(Ordering::Equal),
        Operator::Neq => matches!(
            compare_values(actual, expected),
            Some(Ordering::Less | Ordering::Greater)
        ),
        Operator::Gt => compare_values(actual, expected) == Some(Ordering::Greater),
        Operator::Gte => matches!(
            compare_values(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lt => compare_values(actual, expected) == Some(Ordering::Less),
        Operator::Lte => matches!(
            compare_values(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::Like => pattern_matches(actual, expected, false),
        Operator::ILike => pattern_matches(actual, expected, true),
        Operator::In => match expected {
            Value::Array(items) => items
                .iter()
                .any(|item| compare_values(actual, item) == Some(Ordering::Equal)),
            other => compare_values(actual, other) == Some(Ordering::Equal),
        },
        Operator::Is => match expected {
            Value::Null => actual.is_null(),
            Value::Bool(flag) => actual.as_bool() == Some(*flag),
            _ => false,
        },
    }
}

/// Orders two JSON values the way the database would, coercing textual
/// numbers, booleans, timestamps and dates. `None` means "not comparable",
/// which includes any comparison against null.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(compare_strings(a, b)),
        (Value::Number(a), Value::String(b)) => a.as_f64()?.partial_cmp(&b.parse::<f64>().ok()?),
        (Value::String(a), Value::Number(b)) => a.parse::<f64>().ok()?.partial_cmp(&b.as_f64()?),
        (Value::Bool(a), Value::String(b)) => Some(a.cmp(&b.parse::<bool>().ok()?)),
        (Value::String(a), Value::Bool(b)) => Some(a.parse::<bool>().ok()?.cmp(b)),
        _ => None,
    }
}

fn compare_strings(left: &str, right: &str) -> Ordering {
    if let (Ok(a), Ok(b)) = (
        DateTime::parse_from_rfc3339(left),
        DateTime::parse_from_rfc3339(right),
    ) {
        return a.cmp(&b);
    }
    if let (Ok(a), Ok(b)) = (
        NaiveDate::parse_from_str(left, "%Y-%m-%d"),
        NaiveDate::parse_from_str(right, "%Y-%m-%d"),
    ) {
        return a.cmp(&b);
    }
    left.cmp(right)
}

fn pattern_matches(actual: &Value, pattern: &Value, case_insensitive: bool) -> bool {
    let text = match actual {
        Value::String(value) => value.clone(),
        Value::Number(value) => value.to_string(),
        _ => return false,
    };
    let Some(pattern) = pattern.as_str() else {
        return false;
    };
    if case_insensitive {
        like(&text.to_lowercase(), &pattern.to_lowercase())
    } else {
        like(&text, pattern)
    }
}

/// SQL `LIKE` matching where `%` spans any run of characters and `_` exactly one.
/// A backslash escapes the character after it.
pub fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern = tokenize_like(pattern);
    let (mut t, mut p) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(LikeToken::One) => {
                t += 1;
                p += 1;
            }
            Some(LikeToken::Literal(ch)) if *ch == text[t] => {
                t += 1;
                p += 1;
            }
            Some(LikeToken::Any) => {
                backtrack = Some((p, t));
                p += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|token| *token == LikeToken::Any)
}

/// Escapes LIKE wildcards and backslashes so `text` matches literally.
pub fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LikeToken {
    Any,
    One,
    Literal(char),
}

/// A backslash makes the next character literal; a trailing one is literal itself.
fn tokenize_like(pattern: &str) -> Vec<LikeToken> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        tokens.push(match ch {
            '%' => LikeToken::Any,
            '_' => LikeToken::One,
            '\\' => LikeToken::Literal(chars.next().unwrap_or('\\')),
            other => LikeToken::Literal(other),
        });
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn like_handles_wildcards() {
        assert!(like("acme corp", "%corp"));
        assert!(like("acme corp", "acme%"));
        assert!(like("acme corp", "%me c%"));
        assert!(like("acme", "a_me"));
        assert!(!like("acme", "a_e"));
        assert!(like("", "%"));
        assert!(!like("acme", ""));
    }

    #[test]
    fn escaped_wildcards_match_literally() {
        assert!(like("50% off", "50\\% off"));
        assert!(!like("50x off", "50\\% off"));
        assert!(like("snake_case", "snake\\_case"));
        assert!(!like("snakeXcase", "snake\\_case"));
        assert!(like("a\\b", "a\\\\b"));

        let pattern = format!("%{}%", escape_like("100%_"));
        assert_eq!(pattern, "%100\\%\\_%");
        assert!(like("save 100%_ now", &pattern));
        assert!(!like("save 1000 now", &pattern));
    }

    #[test]
    fn ilike_ignores_case() {
        let filter = Filter::compare("company_name", Operator::ILike, "%ACME%");
        assert!(filter.matches(&row(json!({ "company_name": "Big Acme Inc" }))));
        assert!(!filter.matches(&row(json!({ "company_name": "Globex" }))));
    }

    #[test]
    fn comparisons_never_match_null() {
        let filter = Filter::compare("location", Operator::Neq, "Remote");
        assert!(!filter.matches(&row(json!({ "location": null }))));
        assert!(filter.matches(&row(json!({ "location": "Berlin" }))));
    }

    #[test]
    fn timestamps_compare_chronologically() {
        let filter = Filter::compare("created_at", Operator::Gte, "2024-01-01T00:00:00.5Z");
        assert!(filter.matches(&row(json!({ "created_at": "2024-01-01T00:00:01Z" }))));
        assert!(!filter.matches(&row(json!({ "created_at": "2024-01-01T00:00:00.25Z" }))));
    }

    #[test]
    fn numbers_coerce_from_text() {
        let filter = Filter::compare("count", Operator::Gt, "10");
        assert!(filter.matches(&row(json!({ "count": 11 }))));
        assert!(!filter.matches(&row(json!({ "count": 9 }))));
    }

    #[test]
    fn parses_or_expression() {
        let filter = Filter::parse_or("status.eq.applied,company_name.ilike.%acme%")
            .expect("valid expression");
        assert!(filter.matches(&row(json!({ "status": "applied", "company_name": "Globex" }))));
        assert!(filter.matches(&row(json!({ "status": "offered", "company_name": "ACME" }))));
        assert!(!filter.matches(&row(json!({ "status": "offered", "company_name": "Globex" }))));
    }

    #[test]
    fn parses_nested_and_negated_conditions() {
        let filter = Filter::parse_or(
            "and(status.eq.applied,location.is.null),status.not.in.(wishlist,applied,ghosted)",
        )
        .expect("valid expression");
        assert!(filter.matches(&row(json!({ "status": "applied", "location": null }))));
        assert!(!filter.matches(&row(json!({ "status": "applied", "location": "Remote" }))));
        assert!(filter.matches(&row(json!({ "status": "offered" }))));
        assert!(!filter.matches(&row(json!({ "status": "ghosted" }))));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert_eq!(Filter::parse_or(""), Err(FilterParseError::Empty));
        assert_eq!(
            Filter::parse_or("and(status.eq.applied"),
            Err(FilterParseError::Unbalanced)
        );
        assert!(matches!(
            Filter::parse_or("status.between.1"),
            Err(FilterParseError::UnknownOperator(op)) if op == "between"
        ));
        assert!(matches!(
            Filter::parse_or("status"),
            Err(FilterParseError::Malformed(_))
        ));
    }
}
