//! Per-operator clause match functions.
//!
//! Every operator takes `(user value, clause value)` and answers yes/no.
//! Coercion is strict per operator: numeric operators only accept numbers,
//! date operators only parseable dates, and so on. A value that cannot be
//! interpreted for an operator never errors, it just fails to match.
use chrono::{DateTime, Utc};
use regex::Regex;
use semver::Version;
use serde_json::Value;

use crate::models::Operator;

impl Operator {
    /// Apply the operator to a pair of values. Returns `false` if the
    /// operator cannot be applied or there's a misconfiguration.
    ///
    /// `segmentMatch` is resolved by the evaluator against the store and
    /// never dispatches here; if it shows up anyway it does not match.
    pub fn matches(&self, user_value: &Value, clause_value: &Value) -> bool {
        self.try_matches(user_value, clause_value).unwrap_or(false)
    }

    /// Try applying the operator, returning `None` where it does not apply.
    fn try_matches(&self, user_value: &Value, clause_value: &Value) -> Option<bool> {
        match self {
            Operator::In => Some(strict_equal(user_value, clause_value)),

            Operator::StartsWith => {
                Some(as_str(user_value)?.starts_with(as_str(clause_value)?))
            }
            Operator::EndsWith => Some(as_str(user_value)?.ends_with(as_str(clause_value)?)),
            Operator::Contains => Some(as_str(user_value)?.contains(as_str(clause_value)?)),

            Operator::Matches => {
                let regex = Regex::new(as_str(clause_value)?).ok()?;
                Some(regex.is_match(as_str(user_value)?))
            }

            Operator::LessThan
            | Operator::LessThanOrEqual
            | Operator::GreaterThan
            | Operator::GreaterThanOrEqual => {
                let u = user_value.as_f64()?;
                let c = clause_value.as_f64()?;
                Some(match self {
                    Operator::LessThan => u < c,
                    Operator::LessThanOrEqual => u <= c,
                    Operator::GreaterThan => u > c,
                    Operator::GreaterThanOrEqual => u >= c,
                    _ => unreachable!(),
                })
            }

            Operator::Before | Operator::After => {
                let u = parse_time(user_value)?;
                let c = parse_time(clause_value)?;
                Some(match self {
                    Operator::Before => u < c,
                    Operator::After => u > c,
                    _ => unreachable!(),
                })
            }

            Operator::SemVerEqual | Operator::SemVerLessThan | Operator::SemVerGreaterThan => {
                let u = Version::parse(as_str(user_value)?).ok()?;
                let c = Version::parse(as_str(clause_value)?).ok()?;
                Some(match self {
                    Operator::SemVerEqual => u == c,
                    Operator::SemVerLessThan => u < c,
                    Operator::SemVerGreaterThan => u > c,
                    _ => unreachable!(),
                })
            }

            Operator::SegmentMatch | Operator::Unknown(_) => None,
        }
    }
}

/// Equality within a type: strings to strings, booleans to booleans,
/// numbers as f64 (so `2` matches `2.0`). No cross-type coercion.
fn strict_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        _ => false,
    }
}

fn as_str(value: &Value) -> Option<&str> {
    value.as_str()
}

/// A timestamp is either epoch milliseconds or an RFC-3339 string.
fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => DateTime::from_timestamp_millis(n.as_f64()? as i64),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}
