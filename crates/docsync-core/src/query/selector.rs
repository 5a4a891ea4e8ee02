//! Compiled Mango selectors
//!
//! Selectors are compiled once per prepared query; unknown operators and
//! malformed operands are rejected at compile time so matching itself is
//! infallible.

use crate::document::{DocumentData, get_value_path};
use crate::query::sort::compare_values;
use crate::{Error, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::cmp::Ordering;

/// Something a selector can be evaluated against
pub trait FieldLookup {
    /// Value at a dotted path
    fn lookup(&self, path: &str) -> Option<Cow<'_, Value>>;
}

impl FieldLookup for DocumentData {
    fn lookup(&self, path: &str) -> Option<Cow<'_, Value>> {
        self.get_path(path)
    }
}

impl FieldLookup for Value {
    fn lookup(&self, path: &str) -> Option<Cow<'_, Value>> {
        get_value_path(self, path).map(Cow::Borrowed)
    }
}

/// A compiled selector tree
#[derive(Debug, Clone)]
pub enum Selector {
    /// Every child matches
    And(Vec<Selector>),
    /// At least one child matches
    Or(Vec<Selector>),
    /// No child matches
    Nor(Vec<Selector>),
    /// Conditions on one field
    Field {
        /// Dotted path
        path: String,
        /// All must hold
        operators: Vec<Operator>,
    },
}

/// A field operator
#[derive(Debug, Clone)]
pub enum Operator {
    /// `$eq`
    Eq(Value),
    /// `$ne`
    Ne(Value),
    /// `$gt`
    Gt(Value),
    /// `$gte`
    Gte(Value),
    /// `$lt`
    Lt(Value),
    /// `$lte`
    Lte(Value),
    /// `$in`
    In(Vec<Value>),
    /// `$nin`
    Nin(Vec<Value>),
    /// `$exists`
    Exists(bool),
    /// `$regex` with optional `$options`
    Regex(Regex),
    /// `$size`
    Size(usize),
    /// `$mod` as `[divisor, remainder]`
    Mod(i64, i64),
    /// `$elemMatch` over array elements
    ElemMatch(Box<ElemMatch>),
    /// `$not`
    Not(Vec<Operator>),
}

/// Target of an `$elemMatch`
#[derive(Debug, Clone)]
pub enum ElemMatch {
    /// Element is an object matched by a nested selector
    Selector(Selector),
    /// Element is matched directly by operators
    Operators(Vec<Operator>),
}

/// Operators the index planner can turn into key bounds
pub const LOGICAL_OPERATORS: [&str; 5] = ["$eq", "$gt", "$gte", "$lt", "$lte"];

impl Selector {
    /// Compile a normalized or raw selector object
    pub fn compile(selector: &Map<String, Value>) -> Result<Self> {
        let mut clauses = Vec::with_capacity(selector.len());
        for (key, value) in selector {
            match key.as_str() {
                "$and" | "$or" | "$nor" => {
                    let Value::Array(items) = value else {
                        return Err(Error::query(format!("{key} expects an array")));
                    };
                    let children = items
                        .iter()
                        .map(|item| match item {
                            Value::Object(map) => Selector::compile(map),
                            other => Err(Error::query(format!(
                                "{key} entries must be objects, got {other}"
                            ))),
                        })
                        .collect::<Result<Vec<_>>>()?;
                    clauses.push(match key.as_str() {
                        "$and" => Selector::And(children),
                        "$or" => Selector::Or(children),
                        _ => Selector::Nor(children),
                    });
                }
                _ if key.starts_with('$') => {
                    return Err(Error::query(format!("unknown top-level operator {key}")));
                }
                _ => clauses.push(Selector::Field {
                    path: key.clone(),
                    operators: compile_operators(value)?,
                }),
            }
        }
        Ok(Selector::And(clauses))
    }

    /// Evaluate against a document or JSON value
    pub fn matches<L: FieldLookup + ?Sized>(&self, doc: &L) -> bool {
        match self {
            Selector::And(children) => children.iter().all(|c| c.matches(doc)),
            Selector::Or(children) => children.iter().any(|c| c.matches(doc)),
            Selector::Nor(children) => !children.iter().any(|c| c.matches(doc)),
            Selector::Field { path, operators } => {
                let value = doc.lookup(path);
                operators
                    .iter()
                    .all(|op| op.matches(value.as_deref()))
            }
        }
    }
}

fn compile_operators(value: &Value) -> Result<Vec<Operator>> {
    let Value::Object(map) = value else {
        return Ok(vec![Operator::Eq(value.clone())]);
    };
    if map.is_empty() || !map.keys().all(|k| k.starts_with('$')) {
        return Ok(vec![Operator::Eq(value.clone())]);
    }
    let options = map.get("$options").and_then(Value::as_str).unwrap_or("");
    let mut operators = Vec::with_capacity(map.len());
    for (op, operand) in map {
        let compiled = match op.as_str() {
            "$eq" => Operator::Eq(operand.clone()),
            "$ne" => Operator::Ne(operand.clone()),
            "$gt" => Operator::Gt(operand.clone()),
            "$gte" => Operator::Gte(operand.clone()),
            "$lt" => Operator::Lt(operand.clone()),
            "$lte" => Operator::Lte(operand.clone()),
            "$in" | "$nin" => {
                let Value::Array(items) = operand else {
                    return Err(Error::query(format!("{op} expects an array")));
                };
                if op == "$in" {
                    Operator::In(items.clone())
                } else {
                    Operator::Nin(items.clone())
                }
            }
            "$exists" => Operator::Exists(
                operand
                    .as_bool()
                    .ok_or_else(|| Error::query("$exists expects a boolean"))?,
            ),
            "$regex" => {
                let pattern = operand
                    .as_str()
                    .ok_or_else(|| Error::query("$regex expects a string"))?;
                Operator::Regex(compile_regex(pattern, options)?)
            }
            "$options" => continue,
            "$size" => Operator::Size(
                operand
                    .as_u64()
                    .ok_or_else(|| Error::query("$size expects a non-negative integer"))?
                    as usize,
            ),
            "$mod" => match operand.as_array().map(Vec::as_slice) {
                Some([divisor, remainder]) => {
                    let divisor = divisor.as_i64().filter(|d| *d != 0);
                    match (divisor, remainder.as_i64()) {
                        (Some(d), Some(r)) => Operator::Mod(d, r),
                        _ => return Err(Error::query("$mod expects [non-zero divisor, remainder]")),
                    }
                }
                _ => return Err(Error::query("$mod expects [divisor, remainder]")),
            },
            "$elemMatch" => {
                let Value::Object(inner) = operand else {
                    return Err(Error::query("$elemMatch expects an object"));
                };
                let target = if inner.keys().all(|k| k.starts_with('$'))
                    && !inner.keys().any(|k| matches!(k.as_str(), "$and" | "$or" | "$nor"))
                {
                    ElemMatch::Operators(compile_operators(operand)?)
                } else {
                    ElemMatch::Selector(Selector::compile(inner)?)
                };
                Operator::ElemMatch(Box::new(target))
            }
            "$not" => Operator::Not(compile_operators(operand)?),
            other => return Err(Error::query(format!("unknown operator {other}"))),
        };
        operators.push(compiled);
    }
    Ok(operators)
}

fn compile_regex(pattern: &str, options: &str) -> Result<Regex> {
    let mut flags = String::new();
    for option in options.chars() {
        match option {
            'i' | 'm' | 's' | 'x' => flags.push(option),
            other => return Err(Error::query(format!("unsupported $options flag '{other}'"))),
        }
    }
    let full = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{flags}){pattern}")
    };
    Regex::new(&full).map_err(|e| Error::query(format!("invalid $regex: {e}")))
}

fn same_type(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Null, Value::Null)
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Array(_), Value::Array(_))
            | (Value::Object(_), Value::Object(_))
    )
}

fn values_equal(a: &Value, b: &Value) -> bool {
    same_type(a, b) && compare_values(a, b) == Ordering::Equal
}

/// Scalar match, or any element of an array field
fn any_candidate(value: &Value, pred: impl Fn(&Value) -> bool) -> bool {
    pred(value) || matches!(value, Value::Array(items) if items.iter().any(&pred))
}

fn range_matches(value: Option<&Value>, operand: &Value, accept: fn(Ordering) -> bool) -> bool {
    value.is_some_and(|value| {
        any_candidate(value, |candidate| {
            same_type(candidate, operand) && accept(compare_values(candidate, operand))
        })
    })
}

impl Operator {
    /// Evaluate against the (possibly missing) field value
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Operator::Eq(operand) => eq_matches(value, operand),
            Operator::Ne(operand) => !eq_matches(value, operand),
            Operator::Gt(operand) => range_matches(value, operand, |o| o == Ordering::Greater),
            Operator::Gte(operand) => range_matches(value, operand, |o| o != Ordering::Less),
            Operator::Lt(operand) => range_matches(value, operand, |o| o == Ordering::Less),
            Operator::Lte(operand) => range_matches(value, operand, |o| o != Ordering::Greater),
            Operator::In(options) => options.iter().any(|option| eq_matches(value, option)),
            Operator::Nin(options) => !options.iter().any(|option| eq_matches(value, option)),
            Operator::Exists(expected) => value.is_some() == *expected,
            Operator::Regex(regex) => value.is_some_and(|value| {
                any_candidate(value, |candidate| {
                    candidate.as_str().is_some_and(|s| regex.is_match(s))
                })
            }),
            Operator::Size(size) => {
                matches!(value, Some(Value::Array(items)) if items.len() == *size)
            }
            Operator::Mod(divisor, remainder) => value
                .and_then(Value::as_f64)
                .is_some_and(|n| (n.trunc() as i64) % divisor == *remainder),
            Operator::ElemMatch(target) => match value {
                Some(Value::Array(items)) => items.iter().any(|item| match target.as_ref() {
                    ElemMatch::Selector(selector) => item.is_object() && selector.matches(item),
                    ElemMatch::Operators(ops) => ops.iter().all(|op| op.matches(Some(item))),
                }),
                _ => false,
            },
            Operator::Not(operators) => !operators.iter().all(|op| op.matches(value)),
        }
    }
}

fn eq_matches(value: Option<&Value>, operand: &Value) -> bool {
    match value {
        None => operand.is_null(),
        Some(value) => any_candidate(value, |candidate| values_equal(candidate, operand)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(value: Value) -> Selector {
        Selector::compile(value.as_object().unwrap()).unwrap()
    }

    fn doc() -> Value {
        json!({
            "name": "Alice",
            "age": 31,
            "tags": ["admin", "dev"],
            "scores": [{ "v": 3 }, { "v": 9 }],
            "address": { "city": "Lyon" }
        })
    }

    #[test]
    fn test_comparison_operators() {
        let d = doc();
        assert!(compile(json!({ "age": { "$gt": 30, "$lte": 31 } })).matches(&d));
        assert!(!compile(json!({ "age": { "$lt": 31 } })).matches(&d));
        assert!(!compile(json!({ "age": { "$gt": "3" } })).matches(&d));
        assert!(compile(json!({ "address.city": { "$eq": "Lyon" } })).matches(&d));
        assert!(compile(json!({ "name": { "$ne": "Bob" } })).matches(&d));
    }

    #[test]
    fn test_array_semantics() {
        let d = doc();
        assert!(compile(json!({ "tags": { "$eq": "dev" } })).matches(&d));
        assert!(compile(json!({ "tags": { "$in": ["ops", "admin"] } })).matches(&d));
        assert!(compile(json!({ "tags": { "$nin": ["ops"] } })).matches(&d));
        assert!(compile(json!({ "tags": { "$size": 2 } })).matches(&d));
        assert!(compile(json!({ "scores": { "$elemMatch": { "v": { "$gt": 5 } } } })).matches(&d));
        assert!(compile(json!({ "tags": { "$elemMatch": { "$regex": "^ad" } } })).matches(&d));
    }

    #[test]
    fn test_logical_and_misc() {
        let d = doc();
        assert!(compile(json!({ "$or": [{ "age": 1 }, { "name": "Alice" }] })).matches(&d));
        assert!(!compile(json!({ "$nor": [{ "age": 31 }] })).matches(&d));
        assert!(compile(json!({ "$and": [{ "age": { "$mod": [2, 1] } }] })).matches(&d));
        assert!(compile(json!({ "missing": { "$exists": false } })).matches(&d));
        assert!(compile(json!({ "name": { "$regex": "^ali", "$options": "i" } })).matches(&d));
        assert!(compile(json!({ "age": { "$not": { "$gt": 40 } } })).matches(&d));
        assert!(compile(json!({ "missing": null })).matches(&d));
    }

    #[test]
    fn test_compile_errors() {
        for bad in [
            json!({ "age": { "$near": 1 } }),
            json!({ "$where": "x" }),
            json!({ "$or": {} }),
            json!({ "age": { "$mod": [0, 1] } }),
            json!({ "name": { "$regex": "(" } }),
        ] {
            assert!(Selector::compile(bad.as_object().unwrap()).is_err(), "{bad}");
        }
    }
}
