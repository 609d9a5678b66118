//! Analytics events and the collaborator interfaces that consume them.
//!
//! The core only produces events; batching, delivery, and diagnostics
//! upload live behind the [`EventSink`] and [`DiagnosticsSink`] traits.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::detail::{Detail, Reason};
use crate::models::FeatureFlag;
use crate::user::User;

/// An analytics event.
///
/// Events are deliberately clock-free: the sink stamps them on receipt, so
/// evaluation stays referentially transparent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Event {
    /// One flag evaluation. Evaluating a flag with prerequisites produces
    /// one additional feature event per prerequisite evaluated, carrying
    /// the containing flag's key in `prereq_of`.
    #[serde(rename_all = "camelCase")]
    Feature {
        key: String,
        user: User,
        value: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        variation: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prereq_of: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<Reason>,
        track_events: bool,
    },
    /// A user was presented to the service for indexing.
    #[serde(rename_all = "camelCase")]
    Identify { key: String, user: User },
    /// An application-defined event.
    #[serde(rename_all = "camelCase")]
    Custom {
        key: String,
        user: User,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

/// Consumer of analytics events. Implementations own batching and delivery.
pub trait EventSink: Send + Sync {
    fn send_event(&self, event: Event);
    fn flush(&self);
    fn close(&self);
}

/// Discards all events. Used when event sending is disabled.
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn send_event(&self, _event: Event) {}
    fn flush(&self) {}
    fn close(&self) {}
}

/// Consumer of internal diagnostics.
pub trait DiagnosticsSink: Send + Sync {
    /// Record one streaming connection attempt: when it started, whether it
    /// failed, and how long establishing it took.
    fn record_stream_init(&self, start: chrono::DateTime<chrono::Utc>, failed: bool, duration: Duration);
}

/// Discards all diagnostics. Used when diagnostics are opted out.
pub struct NoopDiagnosticsSink;

impl DiagnosticsSink for NoopDiagnosticsSink {
    fn record_stream_init(
        &self,
        _start: chrono::DateTime<chrono::Utc>,
        _failed: bool,
        _duration: Duration,
    ) {
    }
}

/// Builds feature events, optionally attaching evaluation reasons.
///
/// The detail-returning client entry points use the reason-carrying
/// variant; the plain ones leave reasons off the wire.
#[derive(Debug, Clone, Copy)]
pub struct EventFactory {
    with_reasons: bool,
}

impl EventFactory {
    pub fn new(with_reasons: bool) -> EventFactory {
        EventFactory { with_reasons }
    }

    /// Event for a top-level flag evaluation.
    pub fn feature_event(
        &self,
        flag_key: &str,
        flag: Option<&FeatureFlag>,
        user: &User,
        detail: &Detail,
        default: Option<Value>,
    ) -> Event {
        Event::Feature {
            key: flag_key.to_owned(),
            user: user.clone(),
            value: detail.value.clone(),
            variation: detail.variation_index,
            version: flag.map(|f| f.version),
            default,
            prereq_of: None,
            reason: self.with_reasons.then(|| detail.reason.clone()),
            track_events: flag.map_or(false, |f| f.track_events),
        }
    }

    /// Event for a prerequisite evaluated while evaluating `prereq_of`.
    pub fn prerequisite_event(
        &self,
        prereq_flag: &FeatureFlag,
        user: &User,
        detail: &Detail,
        prereq_of: &str,
    ) -> Event {
        Event::Feature {
            key: prereq_flag.key.clone(),
            user: user.clone(),
            value: detail.value.clone(),
            variation: detail.variation_index,
            version: Some(prereq_flag.version),
            default: None,
            prereq_of: Some(prereq_of.to_owned()),
            reason: self.with_reasons.then(|| detail.reason.clone()),
            track_events: prereq_flag.track_events,
        }
    }

    pub fn identify_event(&self, user: &User) -> Event {
        Event::Identify {
            key: user.key.clone().unwrap_or_default(),
            user: user.clone(),
        }
    }

    pub fn custom_event(&self, key: &str, user: &User, data: Option<Value>) -> Event {
        Event::Custom {
            key: key.to_owned(),
            user: user.clone(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::detail::Reason;

    fn flag() -> FeatureFlag {
        serde_json::from_value(
            json!({"key": "f", "version": 2, "on": true, "variations": ["a", "b"], "trackEvents": true}),
        )
        .unwrap()
    }

    fn detail() -> Detail {
        Detail {
            value: Some(json!("b")),
            variation_index: Some(1),
            reason: Reason::Fallthrough,
        }
    }

    #[test]
    fn reasons_are_attached_only_when_requested() {
        let user = User::with_key("u");

        let plain = EventFactory::new(false).feature_event("f", Some(&flag()), &user, &detail(), None);
        let Event::Feature { reason, .. } = plain else {
            panic!("expected feature event")
        };
        assert_eq!(reason, None);

        let detailed =
            EventFactory::new(true).feature_event("f", Some(&flag()), &user, &detail(), None);
        let Event::Feature { reason, .. } = detailed else {
            panic!("expected feature event")
        };
        assert_eq!(reason, Some(Reason::Fallthrough));
    }

    #[test]
    fn prerequisite_event_carries_the_parent_key() {
        let event = EventFactory::new(false).prerequisite_event(
            &flag(),
            &User::with_key("u"),
            &detail(),
            "parent-flag",
        );
        let Event::Feature {
            key,
            version,
            prereq_of,
            value,
            variation,
            ..
        } = event
        else {
            panic!("expected feature event")
        };
        assert_eq!(key, "f");
        assert_eq!(version, Some(2));
        assert_eq!(prereq_of.as_deref(), Some("parent-flag"));
        assert_eq!(value, Some(json!("b")));
        assert_eq!(variation, Some(1));
    }
}
