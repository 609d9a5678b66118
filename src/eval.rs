//! The evaluation engine.
//!
//! Evaluation is a deterministic interpretation of the flag's rule data
//! against one user and one store snapshot: no clocks, no randomness, and
//! no network. Rule and clause iteration is flat loops, so pathological
//! flags with thousands of rules or clauses cost memory, not stack.
//! Prerequisites re-enter the interpreter per referenced flag and re-read
//! the store on every hop.
use serde_json::Value;

use crate::bucketing::bucket_user;
use crate::detail::{Detail, ErrorKind, Reason};
use crate::events::{Event, EventFactory};
use crate::models::{Clause, FeatureFlag, FlagRule, Operator, Segment, SegmentRule, VariationOrRollout};
use crate::store::{self, DataStore};
use crate::user::User;

/// Weights are expressed in units of 1/100,000.
const WEIGHT_SCALE: f64 = 100_000.0;

/// An inconsistency in the flag's own rule data, discovered mid-evaluation.
///
/// These never abort the evaluation; they accompany a
/// `MALFORMED_FLAG` detail so the caller can log them.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("variation/rollout object with no variation or rollout")]
    EmptyVariationOrRollout,
    #[error("invalid variation index in flag")]
    InvalidVariationIndex,
}

/// The complete outcome of one evaluation: the detail to hand back, the
/// prerequisite events produced along the way, and any rule-data error.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    pub detail: Detail,
    pub events: Vec<Event>,
    pub error: Option<EvalError>,
}

impl EvalResult {
    fn without_events(error: Option<EvalError>, detail: Detail) -> EvalResult {
        EvalResult {
            detail,
            events: Vec::new(),
            error,
        }
    }
}

/// Evaluate `flag` for `user` against the given store snapshot.
pub fn evaluate(
    store: &dyn DataStore,
    flag: &FeatureFlag,
    user: &User,
    factory: &EventFactory,
) -> EvalResult {
    if user.key.as_deref().map_or(true, str::is_empty) {
        return EvalResult::without_events(None, Detail::error(ErrorKind::UserNotSpecified));
    }

    let mut events = Vec::new();
    let (error, detail) = eval_flag(store, flag, user, factory, &mut events);
    EvalResult {
        detail,
        events,
        error,
    }
}

fn eval_flag(
    store: &dyn DataStore,
    flag: &FeatureFlag,
    user: &User,
    factory: &EventFactory,
    events: &mut Vec<Event>,
) -> (Option<EvalError>, Detail) {
    if !flag.on {
        return off_detail(flag, Reason::Off);
    }

    for prerequisite in &flag.prerequisites {
        let Some(prereq_flag) = store::get_flag(store, &prerequisite.key) else {
            // A missing prerequisite fails the flag without producing an
            // event: there is nothing to report an evaluation of.
            return off_detail(flag, prerequisite_failed(&prerequisite.key));
        };

        let (prereq_error, prereq_detail) = eval_flag(store, &prereq_flag, user, factory, events);
        events.push(factory.prerequisite_event(&prereq_flag, user, &prereq_detail, &flag.key));

        if prereq_error.is_some() {
            let (_, detail) = off_detail(flag, prerequisite_failed(&prerequisite.key));
            return (prereq_error, detail);
        }
        let satisfied =
            prereq_flag.on && prereq_detail.variation_index == Some(prerequisite.variation);
        if !satisfied {
            return off_detail(flag, prerequisite_failed(&prerequisite.key));
        }
    }

    if let Some(key) = &user.key {
        for target in &flag.targets {
            if target.values.iter().any(|value| value == key) {
                return variation_detail(flag, target.variation, Reason::TargetMatch);
            }
        }
    }

    for (rule_index, rule) in flag.rules.iter().enumerate() {
        if rule_matches(store, rule, user) {
            return resolve_variation_or_rollout(
                flag,
                &rule.variation_or_rollout,
                user,
                Reason::RuleMatch {
                    rule_index,
                    rule_id: rule.id.clone(),
                },
            );
        }
    }

    resolve_variation_or_rollout(flag, &flag.fallthrough, user, Reason::Fallthrough)
}

fn prerequisite_failed(key: &str) -> Reason {
    Reason::PrerequisiteFailed {
        prerequisite_key: key.to_owned(),
    }
}

/// The flag's off result: the off variation if one is configured, a valueless
/// detail otherwise.
fn off_detail(flag: &FeatureFlag, reason: Reason) -> (Option<EvalError>, Detail) {
    match flag.off_variation {
        Some(index) => variation_detail(flag, index, reason),
        None => (
            None,
            Detail {
                value: None,
                variation_index: None,
                reason,
            },
        ),
    }
}

fn variation_detail(
    flag: &FeatureFlag,
    index: usize,
    reason: Reason,
) -> (Option<EvalError>, Detail) {
    match flag.variations.get(index) {
        Some(value) => (
            None,
            Detail {
                value: Some(value.clone()),
                variation_index: Some(index),
                reason,
            },
        ),
        None => (
            Some(EvalError::InvalidVariationIndex),
            Detail::error(ErrorKind::MalformedFlag),
        ),
    }
}

fn resolve_variation_or_rollout(
    flag: &FeatureFlag,
    vor: &VariationOrRollout,
    user: &User,
    reason: Reason,
) -> (Option<EvalError>, Detail) {
    if let Some(index) = vor.variation {
        return variation_detail(flag, index, reason);
    }

    if let Some(rollout) = &vor.rollout {
        if let Some(last) = rollout.variations.last() {
            let bucket_by = rollout.bucket_by.as_deref().unwrap_or("key");
            let bucket = bucket_user(user, &flag.key, bucket_by, &flag.salt);

            let mut sum = 0.0;
            for weighted in &rollout.variations {
                sum += weighted.weight as f64 / WEIGHT_SCALE;
                if bucket < sum {
                    return variation_detail(flag, weighted.variation, reason);
                }
            }
            // The weights don't cover the whole bucket space (rounding or
            // malformed data); the last slice absorbs the remainder.
            return variation_detail(flag, last.variation, reason);
        }
    }

    (
        Some(EvalError::EmptyVariationOrRollout),
        Detail::error(ErrorKind::MalformedFlag),
    )
}

/// A rule matches iff it has at least one clause and every clause matches.
fn rule_matches(store: &dyn DataStore, rule: &FlagRule, user: &User) -> bool {
    !rule.clauses.is_empty()
        && rule
            .clauses
            .iter()
            .all(|clause| clause_matches(store, clause, user))
}

fn clause_matches(store: &dyn DataStore, clause: &Clause, user: &User) -> bool {
    if clause.op == Operator::SegmentMatch {
        let matched = clause.values.iter().any(|value| {
            value.as_str().map_or(false, |segment_key| {
                store::get_segment(store, segment_key)
                    .map_or(false, |segment| segment_matches(&segment, user))
            })
        });
        return maybe_negate(clause, matched);
    }
    clause_matches_no_segments(clause, user)
}

/// Clause semantics outside of segment resolution. Segment rules use this
/// directly, so a `segmentMatch` clause cannot nest inside a segment.
fn clause_matches_no_segments(clause: &Clause, user: &User) -> bool {
    let user_value = match user.attribute(&clause.attribute) {
        Some(value) if !value.is_null() => value,
        _ => return maybe_negate(clause, false),
    };

    let matched = match &user_value {
        // A multi-valued attribute matches if any of its elements does.
        Value::Array(elements) => elements
            .iter()
            .any(|element| clause_matches_value(clause, element)),
        single => clause_matches_value(clause, single),
    };
    maybe_negate(clause, matched)
}

fn clause_matches_value(clause: &Clause, user_value: &Value) -> bool {
    clause
        .values
        .iter()
        .any(|clause_value| clause.op.matches(user_value, clause_value))
}

fn maybe_negate(clause: &Clause, matched: bool) -> bool {
    if clause.negate {
        !matched
    } else {
        matched
    }
}

/// Whether `user` belongs to `segment`.
///
/// Explicit inclusion wins over explicit exclusion; rules apply only to
/// users named by neither list.
pub(crate) fn segment_matches(segment: &Segment, user: &User) -> bool {
    let Some(key) = user.key.as_ref() else {
        return false;
    };
    if segment.included.iter().any(|included| included == key) {
        return true;
    }
    if segment.excluded.iter().any(|excluded| excluded == key) {
        return false;
    }
    segment
        .rules
        .iter()
        .any(|rule| segment_rule_matches(segment, rule, user))
}

fn segment_rule_matches(segment: &Segment, rule: &SegmentRule, user: &User) -> bool {
    if !rule
        .clauses
        .iter()
        .all(|clause| clause_matches_no_segments(clause, user))
    {
        return false;
    }

    let Some(weight) = rule.weight else {
        return true;
    };
    let bucket_by = rule.bucket_by.as_deref().unwrap_or("key");
    let bucket = bucket_user(user, &segment.key, bucket_by, &segment.salt);
    bucket < weight as f64 / WEIGHT_SCALE
}
