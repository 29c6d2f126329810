//! Query filters.
//!
//! Hooks see and replace filters as JSON objects in the familiar document
//! style:
//!
//! ```json
//! { "title": { "$like": "%rust%" }, "$or": [{ "draft": false }, { "author": 7 }] }
//! ```
//!
//! The entity manager parses that JSON into [`Filter`] before running a query.
//! Nested objects without operator keys address relation paths
//! (`{"author": {"name": "ann"}}` is the path `author.name`).

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::errors::CrudError;
use crate::orm::meta::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Like,
}

impl Operator {
    fn parse(key: &str) -> Option<Self> {
        Some(match key {
            "$eq" => Self::Eq,
            "$ne" => Self::Ne,
            "$gt" => Self::Gt,
            "$gte" => Self::Gte,
            "$lt" => Self::Lt,
            "$lte" => Self::Lte,
            "$in" => Self::In,
            "$nin" => Self::Nin,
            "$like" => Self::Like,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every row.
    All,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Compare {
        field: String,
        op: Operator,
        value: Value,
    },
}

impl Filter {
    pub fn compare(field: impl Into<String>, op: Operator, value: Value) -> Self {
        Self::Compare {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::compare(field, Operator::Eq, value)
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::compare(field, Operator::In, Value::Array(values))
    }

    /// Conjunction of equality tests, one per entry of `row`.
    #[must_use]
    pub fn matching(row: &Row) -> Self {
        Self::And(
            row.iter()
                .map(|(field, value)| Self::eq(field.clone(), value.clone()))
                .collect(),
        )
    }

    /// Parse a JSON filter document.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown `$` operators or malformed
    /// `$and`/`$or` operands.
    pub fn parse(value: &Value) -> Result<Self, CrudError> {
        match value {
            Value::Null => Ok(Self::All),
            Value::Object(map) => parse_object(map, None),
            other => Err(CrudError::validation(format!(
                "a filter must be an object, got {other}"
            ))),
        }
    }

    /// Evaluate against a stored row. Used by the in-memory driver.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::All => true,
            Self::And(filters) => filters.iter().all(|f| f.matches(row)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(row)),
            Self::Not(filter) => !filter.matches(row),
            Self::Compare { field, op, value } => {
                let actual = row.get(field).unwrap_or(&Value::Null);
                compare(actual, *op, value)
            }
        }
    }
}

fn join_path(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}.{key}"),
        None => key.to_string(),
    }
}

fn parse_list(operand: &Value, key: &str, prefix: Option<&str>) -> Result<Vec<Filter>, CrudError> {
    let Value::Array(items) = operand else {
        return Err(CrudError::validation(format!("'{key}' expects an array")));
    };
    items
        .iter()
        .map(|item| match item {
            Value::Object(map) => parse_object(map, prefix),
            other => Err(CrudError::validation(format!(
                "'{key}' items must be objects, got {other}"
            ))),
        })
        .collect()
}

fn parse_object(map: &Map<String, Value>, prefix: Option<&str>) -> Result<Filter, CrudError> {
    let mut parts = Vec::with_capacity(map.len());
    for (key, operand) in map {
        match key.as_str() {
            "$and" => parts.push(Filter::And(parse_list(operand, key, prefix)?)),
            "$or" => parts.push(Filter::Or(parse_list(operand, key, prefix)?)),
            "$not" => match operand {
                Value::Object(inner) => {
                    parts.push(Filter::Not(Box::new(parse_object(inner, prefix)?)));
                }
                other => {
                    return Err(CrudError::validation(format!(
                        "'$not' expects an object, got {other}"
                    )));
                }
            },
            field if field.starts_with('$') => {
                return Err(CrudError::validation(format!(
                    "operator '{field}' is not supported here"
                )));
            }
            field => parts.push(parse_field(&join_path(prefix, field), operand)?),
        }
    }
    Ok(match parts.len() {
        0 => Filter::All,
        1 => parts.remove(0),
        _ => Filter::And(parts),
    })
}

fn parse_field(path: &str, operand: &Value) -> Result<Filter, CrudError> {
    match operand {
        Value::Array(items) => Ok(Filter::is_in(path, items.clone())),
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => {
            let mut parts = Vec::with_capacity(map.len());
            for (key, value) in map {
                if key == "$not" {
                    parts.push(Filter::Not(Box::new(parse_field(path, value)?)));
                    continue;
                }
                let op = Operator::parse(key).ok_or_else(|| {
                    CrudError::validation(format!("unknown filter operator '{key}'"))
                })?;
                parts.push(Filter::compare(path, op, value.clone()));
            }
            Ok(if parts.len() == 1 {
                parts.remove(0)
            } else {
                Filter::And(parts)
            })
        }
        Value::Object(map) => parse_object(map, Some(path)),
        scalar => Ok(Filter::eq(path, scalar.clone())),
    }
}

/// Loose equality: numbers compare by value, numeric strings equal numbers.
pub(crate) fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(n), Value::String(s)) => n.as_f64()?.partial_cmp(&s.parse::<f64>().ok()?),
        (Value::String(s), Value::Number(n)) => s.parse::<f64>().ok()?.partial_cmp(&n.as_f64()?),
        _ => None,
    }
}

/// Total order used for sorting rows; nulls first.
pub(crate) fn sort_order(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => order(left, right).unwrap_or(Ordering::Equal),
    }
}

fn compare(actual: &Value, op: Operator, expected: &Value) -> bool {
    match op {
        Operator::Eq => values_equal(actual, expected),
        Operator::Ne => !values_equal(actual, expected),
        Operator::Gt => order(actual, expected) == Some(Ordering::Greater),
        Operator::Gte => matches!(
            order(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lt => order(actual, expected) == Some(Ordering::Less),
        Operator::Lte => matches!(
            order(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::In => expected
            .as_array()
            .is_some_and(|items| items.iter().any(|v| values_equal(actual, v))),
        Operator::Nin => !expected
            .as_array()
            .is_some_and(|items| items.iter().any(|v| values_equal(actual, v))),
        Operator::Like => match (actual, expected) {
            (Value::String(text), Value::String(pattern)) => like(text, pattern),
            (Value::Number(n), Value::String(pattern)) => like(&n.to_string(), pattern),
            _ => false,
        },
    }
}

/// SQL `LIKE` with `%` and `_`, ASCII case-insensitive like SQLite.
pub(crate) fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().map(|c| c.to_ascii_lowercase()).collect();
    let pattern: Vec<char> = pattern.chars().map(|c| c.to_ascii_lowercase()).collect();
    like_at(&text, &pattern)
}

fn like_at(text: &[char], pattern: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('%', rest)) => (0..=text.len()).any(|skip| like_at(&text[skip..], rest)),
        Some(('_', rest)) => !text.is_empty() && like_at(&text[1..], rest),
        Some((c, rest)) => text.first() == Some(c) && like_at(&text[1..], rest),
    }
}
