//! # Predicate Evaluator
//!
//! Structured matchers over JSON documents, shared by `query`/`count` and
//! the subscription fan-out. A predicate is a mapping `{field → condition}`
//! where a condition is either a literal (strict equality) or a mapping of
//! operator → operand:
//!
//! | Op | Meaning |
//! |----|---------|
//! | `$eq` | strict equality |
//! | `$ne` | strict inequality |
//! | `$lt` `$lte` `$gt` `$gte` | numeric / lexicographic ordering |
//! | `$in` | operand is an array containing the value |
//! | `$nin` | operand is an array not containing the value |
//! | `$regex` | value is a string matching the operand (substring) |
//! | `$sw` | value is a string starting with the operand |
//!
//! A document matches iff every field's condition holds. A missing field
//! only satisfies `$ne` and `$nin`. Unknown operators, non-array `$in`
//! operands, and invalid regexes fail the condition rather than erroring —
//! a bad predicate simply matches nothing.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value as JsonValue;

use crate::error::Result;

/// The canonical serialized form of a predicate.
///
/// serde_json's default object representation keeps keys sorted, so two
/// structurally identical predicates serialize to the same string. Used to
/// deduplicate subscription groups.
pub fn canonical(predicate: &JsonValue) -> Result<String> {
    Ok(serde_json::to_string(predicate)?)
}

/// Returns true iff `doc` satisfies every field condition of `predicate`.
pub fn matches(doc: &JsonValue, predicate: &JsonValue) -> bool {
    let Some(fields) = predicate.as_object() else {
        return false;
    };
    fields
        .iter()
        .all(|(field, condition)| match_condition(doc.get(field), condition))
}

/// Evaluates a single condition against a (possibly missing) field value.
fn match_condition(value: Option<&JsonValue>, condition: &JsonValue) -> bool {
    if let Some(ops) = condition.as_object() {
        if ops.keys().any(|k| k.starts_with('$')) {
            return ops.iter().all(|(op, operand)| apply_op(value, op, operand));
        }
    }
    // Literal condition: strict equality with the present value.
    value.is_some_and(|v| v == condition)
}

fn apply_op(value: Option<&JsonValue>, op: &str, operand: &JsonValue) -> bool {
    match op {
        "$eq" => value.is_some_and(|v| v == operand),
        "$ne" => value != Some(operand),
        "$lt" | "$lte" | "$gt" | "$gte" => value
            .and_then(|v| compare(v, operand))
            .is_some_and(|ord| match op {
                "$lt" => ord == Ordering::Less,
                "$lte" => ord != Ordering::Greater,
                "$gt" => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }),
        "$in" => operand
            .as_array()
            .is_some_and(|arr| value.is_some_and(|v| arr.contains(v))),
        "$nin" => operand
            .as_array()
            .is_some_and(|arr| value.is_none_or(|v| !arr.contains(v))),
        "$regex" => match (value.and_then(JsonValue::as_str), operand.as_str()) {
            (Some(s), Some(source)) => Regex::new(source).map(|re| re.is_match(s)).unwrap_or(false),
            _ => false,
        },
        "$sw" => match (value.and_then(JsonValue::as_str), operand.as_str()) {
            (Some(s), Some(prefix)) => s.starts_with(prefix),
            _ => false,
        },
        // Unknown operator: the condition fails.
        _ => false,
    }
}

/// Type-aware ordering: numbers compare numerically, strings
/// lexicographically, anything else is unordered.
pub fn compare(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            x.as_f64().and_then(|x| y.as_f64().and_then(|y| x.partial_cmp(&y)))
        }
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> JsonValue {
        json!({"id": "u1", "name": "Johnny", "age": 30, "city": "Oslo"})
    }

    #[test]
    fn test_literal_equality() {
        assert!(matches(&doc(), &json!({"name": "Johnny"})));
        assert!(!matches(&doc(), &json!({"name": "Jane"})));
        assert!(matches(&doc(), &json!({"name": "Johnny", "age": 30})));
        assert!(!matches(&doc(), &json!({"name": "Johnny", "age": 31})));
    }

    #[test]
    fn test_eq_ne() {
        assert!(matches(&doc(), &json!({"age": {"$eq": 30}})));
        assert!(matches(&doc(), &json!({"age": {"$ne": 31}})));
        assert!(!matches(&doc(), &json!({"age": {"$ne": 30}})));
    }

    #[test]
    fn test_ordering_ops() {
        assert!(matches(&doc(), &json!({"age": {"$lt": 31}})));
        assert!(matches(&doc(), &json!({"age": {"$lte": 30}})));
        assert!(matches(&doc(), &json!({"age": {"$gt": 29}})));
        assert!(matches(&doc(), &json!({"age": {"$gte": 30}})));
        assert!(!matches(&doc(), &json!({"age": {"$lt": 30}})));
        // Lexicographic for strings.
        assert!(matches(&doc(), &json!({"city": {"$gt": "Bergen"}})));
        // Mixed types are unordered, so the condition fails.
        assert!(!matches(&doc(), &json!({"age": {"$lt": "thirty"}})));
    }

    #[test]
    fn test_range_via_operator_pair() {
        assert!(matches(&doc(), &json!({"age": {"$gte": 30, "$lt": 40}})));
        assert!(!matches(&doc(), &json!({"age": {"$gte": 31, "$lt": 40}})));
    }

    #[test]
    fn test_in_nin() {
        assert!(matches(&doc(), &json!({"city": {"$in": ["Oslo", "Bergen"]}})));
        assert!(!matches(&doc(), &json!({"city": {"$in": ["Bergen"]}})));
        assert!(matches(&doc(), &json!({"city": {"$nin": ["Bergen"]}})));
        // Non-array operand fails the condition.
        assert!(!matches(&doc(), &json!({"city": {"$in": "Oslo"}})));
    }

    #[test]
    fn test_regex_and_sw() {
        assert!(matches(&doc(), &json!({"name": {"$regex": "^John"}})));
        assert!(matches(&doc(), &json!({"name": {"$regex": "hnn"}})));
        assert!(!matches(&doc(), &json!({"name": {"$regex": "^Jane"}})));
        assert!(matches(&doc(), &json!({"name": {"$sw": "John"}})));
        assert!(!matches(&doc(), &json!({"name": {"$sw": "ohn"}})));
        // Invalid regex matches nothing.
        assert!(!matches(&doc(), &json!({"name": {"$regex": "("}})));
        // Non-string value never matches a regex.
        assert!(!matches(&doc(), &json!({"age": {"$regex": "3"}})));
    }

    #[test]
    fn test_missing_field_rules() {
        // Only $ne and $nin may match a missing field.
        assert!(matches(&doc(), &json!({"missing": {"$ne": 1}})));
        assert!(matches(&doc(), &json!({"missing": {"$nin": [1, 2]}})));
        assert!(!matches(&doc(), &json!({"missing": {"$eq": 1}})));
        assert!(!matches(&doc(), &json!({"missing": {"$lt": 1}})));
        assert!(!matches(&doc(), &json!({"missing": {"$in": [1]}})));
        assert!(!matches(&doc(), &json!({"missing": 1})));
    }

    #[test]
    fn test_unknown_operator_fails() {
        assert!(!matches(&doc(), &json!({"age": {"$almost": 30}})));
        // One unknown op poisons the whole condition even next to a valid one.
        assert!(!matches(&doc(), &json!({"age": {"$gte": 1, "$almost": 30}})));
    }

    #[test]
    fn test_object_literal_without_ops() {
        let nested = json!({"id": "n1", "pos": {"x": 1, "y": 2}});
        assert!(matches(&nested, &json!({"pos": {"x": 1, "y": 2}})));
        assert!(!matches(&nested, &json!({"pos": {"x": 1}})));
    }

    #[test]
    fn test_canonical_dedupes_identical_predicates() {
        let a = canonical(&json!({"b": 1, "a": {"$gt": 2}})).unwrap();
        let b = canonical(&json!({"a": {"$gt": 2}, "b": 1})).unwrap();
        assert_eq!(a, b);
    }
}
