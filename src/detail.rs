//! Evaluation results: the value served, the variation index it came from,
//! and the reason it was chosen.
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why an evaluation produced the value it did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// The flag is off and the off variation was served.
    Off,
    /// No target or rule matched; the fallthrough variation was served.
    Fallthrough,
    /// The user's key was explicitly targeted.
    TargetMatch,
    /// A rule matched.
    #[serde(rename_all = "camelCase")]
    RuleMatch { rule_index: usize, rule_id: String },
    /// A prerequisite flag was off, missing, or served the wrong variation.
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed { prerequisite_key: String },
    /// The evaluation could not complete; the caller's default was served.
    #[serde(rename_all = "camelCase")]
    Error { error_kind: ErrorKind },
}

/// Classifies an [`Reason::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Evaluation was attempted before the client received any rule data.
    ClientNotReady,
    /// No flag exists under the requested key.
    FlagNotFound,
    /// The user record was missing or had no key.
    UserNotSpecified,
    /// The flag's rule data is internally inconsistent (bad variation
    /// index, empty rollout, and similar).
    MalformedFlag,
    /// The flag's value did not have the type the caller asked for.
    WrongType,
    /// An unexpected internal failure was captured.
    Exception,
}

/// The complete result of one evaluation.
///
/// `value` is `None` when the flag is off with no off variation, or when an
/// error occurred and no default was supplied at this layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detail {
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation_index: Option<usize>,
    pub reason: Reason,
}

impl Detail {
    /// An error result with no value.
    pub fn error(error_kind: ErrorKind) -> Detail {
        Detail {
            value: None,
            variation_index: None,
            reason: Reason::Error { error_kind },
        }
    }

    /// Substitute the caller's default for a missing value.
    pub fn or_default(mut self, default: Value) -> Detail {
        if self.value.is_none() {
            self.value = Some(default);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reason_wire_shapes() {
        assert_eq!(
            serde_json::to_value(Reason::Off).unwrap(),
            json!({"kind": "OFF"})
        );
        assert_eq!(
            serde_json::to_value(Reason::RuleMatch {
                rule_index: 1,
                rule_id: "abc".to_owned()
            })
            .unwrap(),
            json!({"kind": "RULE_MATCH", "ruleIndex": 1, "ruleId": "abc"})
        );
        assert_eq!(
            serde_json::to_value(Reason::PrerequisiteFailed {
                prerequisite_key: "other".to_owned()
            })
            .unwrap(),
            json!({"kind": "PREREQUISITE_FAILED", "prerequisiteKey": "other"})
        );
        assert_eq!(
            serde_json::to_value(Reason::Error {
                error_kind: ErrorKind::FlagNotFound
            })
            .unwrap(),
            json!({"kind": "ERROR", "errorKind": "FLAG_NOT_FOUND"})
        );
    }

    #[test]
    fn reason_round_trips() {
        for reason in [
            Reason::Off,
            Reason::Fallthrough,
            Reason::TargetMatch,
            Reason::RuleMatch {
                rule_index: 3,
                rule_id: "id".to_owned(),
            },
            Reason::Error {
                error_kind: ErrorKind::MalformedFlag,
            },
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            let back: Reason = serde_json::from_str(&json).unwrap();
            assert_eq!(back, reason);
        }
    }

    #[test]
    fn detail_serializes_camel_case() {
        let detail = Detail {
            value: Some(json!("b")),
            variation_index: Some(1),
            reason: Reason::Off,
        };
        assert_eq!(
            serde_json::to_value(&detail).unwrap(),
            json!({"value": "b", "variationIndex": 1, "reason": {"kind": "OFF"}})
        );
    }

    #[test]
    fn or_default_fills_only_missing_values() {
        let detail = Detail::error(ErrorKind::FlagNotFound).or_default(json!(42));
        assert_eq!(detail.value, Some(json!(42)));

        let detail = Detail {
            value: Some(json!("kept")),
            variation_index: Some(0),
            reason: Reason::Fallthrough,
        }
        .or_default(json!("unused"));
        assert_eq!(detail.value, Some(json!("kept")));
    }
}
