//! The client facade applications interact with.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::config::Config;
use crate::detail::{Detail, ErrorKind};
use crate::eval;
use crate::events::{DiagnosticsSink, EventFactory, EventSink, NoopDiagnosticsSink, NoopEventSink};
use crate::flags_state::{FlagMetadata, FlagsState, FlagsStateOptions};
use crate::models::FeatureFlag;
use crate::polling::{PollingProcessor, PollingProcessorConfig};
use crate::requestor::{Requestor, RequestorConfig};
use crate::store::{self, DataKind, DataStore, InMemoryDataStore, Item, NotifyingDataStore};
use crate::streaming::{StreamingProcessor, StreamingProcessorConfig};
use crate::user::User;
use crate::Result;

enum UpdateProcessor {
    Streaming(StreamingProcessor),
    Polling(PollingProcessor),
}

/// A feature-flag client.
///
/// Create one through [`Config`], let it initialize, then evaluate flags
/// with [`Client::variation`] and friends. Evaluation is always local: the
/// client answers from its store and never blocks callers on the network.
///
/// # Examples
/// ```no_run
/// # use flagstream::{Config, User};
/// let client = Config::from_sdk_key("sdk-key").to_client().unwrap();
/// client.wait_for_initialization().unwrap();
///
/// let user = User::with_key("user-key");
/// if client.bool_variation("new-dashboard", &user, false) {
///     // show the new dashboard
/// }
/// ```
pub struct Client {
    store: Arc<NotifyingDataStore>,
    processor: Option<UpdateProcessor>,
    events: Arc<dyn EventSink>,
    offline: bool,
    closed: AtomicBool,
}

impl Client {
    /// Create a client and start its update processor.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty SDK key or an invalid
    /// URI, and an IO error if a background thread could not be spawned.
    pub fn new(mut config: Config) -> Result<Client> {
        config.validate()?;

        let inner: Arc<dyn DataStore> = match config.store.take() {
            Some(store) => store,
            None => Arc::new(InMemoryDataStore::new()),
        };
        let store = Arc::new(NotifyingDataStore::new(inner));

        let events: Arc<dyn EventSink> = match (config.send_events, config.event_sink.take()) {
            (true, Some(sink)) => sink,
            _ => Arc::new(NoopEventSink),
        };
        let diagnostics: Arc<dyn DiagnosticsSink> =
            match (config.diagnostic_opt_out, config.diagnostics.take()) {
                (false, Some(sink)) => sink,
                _ => Arc::new(NoopDiagnosticsSink),
            };

        if config.offline {
            log::info!(target: "flagstream", "starting in offline mode, serving defaults");
            store.init(Default::default());
            return Ok(Client {
                store,
                processor: None,
                events,
                offline: true,
                closed: AtomicBool::new(false),
            });
        }

        if config.use_external_store {
            log::info!(target: "flagstream", "relying on an externally updated store");
            return Ok(Client {
                store,
                processor: None,
                events,
                offline: false,
                closed: AtomicBool::new(false),
            });
        }

        let requestor = Requestor::new(RequestorConfig {
            base_uri: config.base_uri.clone(),
            http: config.http_config(),
        });

        let processor = if config.stream {
            let streaming = StreamingProcessor::start(
                StreamingProcessorConfig {
                    stream_uri: config.stream_uri.clone(),
                    http: config.http_config(),
                    initial_reconnect_delay: config.stream_initial_reconnect_delay,
                },
                requestor,
                store.clone() as Arc<dyn DataStore>,
                diagnostics,
                None,
            )?;
            UpdateProcessor::Streaming(streaming)
        } else {
            let polling = PollingProcessor::start(
                requestor,
                store.clone() as Arc<dyn DataStore>,
                PollingProcessorConfig::new().with_interval(config.poll_interval),
            )?;
            UpdateProcessor::Polling(polling)
        };

        Ok(Client {
            store,
            processor: Some(processor),
            events,
            offline: false,
            closed: AtomicBool::new(false),
        })
    }

    /// Whether the client holds rule data and can evaluate flags.
    pub fn initialized(&self) -> bool {
        self.store.initialized()
    }

    /// Block until the update processor has stored its first snapshot.
    ///
    /// # Errors
    ///
    /// Returns the processor's terminal error if it failed permanently
    /// (for example, the service rejected the SDK key).
    pub fn wait_for_initialization(&self) -> Result<()> {
        match &self.processor {
            Some(UpdateProcessor::Streaming(processor)) => processor.wait_for_initialization(),
            Some(UpdateProcessor::Polling(processor)) => processor.wait_for_initialization(),
            None => Ok(()),
        }
    }

    /// Evaluate a flag for a user, returning the caller's default when no
    /// value can be served.
    pub fn variation(&self, flag_key: &str, user: &User, default: Value) -> Value {
        let factory = EventFactory::new(false);
        let detail = self.evaluate_and_record(flag_key, user, default.clone(), &factory);
        detail.value.unwrap_or(default)
    }

    /// Like [`Client::variation`], but also explains why the value was
    /// chosen.
    pub fn variation_detail(&self, flag_key: &str, user: &User, default: Value) -> Detail {
        let factory = EventFactory::new(true);
        self.evaluate_and_record(flag_key, user, default, &factory)
    }

    /// Evaluate a boolean flag. A non-boolean result serves the default
    /// with a `WRONG_TYPE` error reason.
    pub fn bool_variation(&self, flag_key: &str, user: &User, default: bool) -> bool {
        let detail =
            self.typed_variation(flag_key, user, Value::Bool(default), Value::is_boolean);
        match detail.value {
            Some(Value::Bool(value)) => value,
            _ => default,
        }
    }

    /// Evaluate a string flag. A non-string result serves the default
    /// with a `WRONG_TYPE` error reason.
    pub fn string_variation(&self, flag_key: &str, user: &User, default: &str) -> String {
        let detail = self.typed_variation(
            flag_key,
            user,
            Value::String(default.to_owned()),
            Value::is_string,
        );
        match detail.value {
            Some(Value::String(value)) => value,
            _ => default.to_owned(),
        }
    }

    /// Evaluate a numeric flag. A non-numeric result serves the default
    /// with a `WRONG_TYPE` error reason.
    pub fn number_variation(&self, flag_key: &str, user: &User, default: f64) -> f64 {
        let fallback = serde_json::Number::from_f64(default)
            .map(Value::Number)
            .unwrap_or(Value::Null);
        let detail = self.typed_variation(flag_key, user, fallback, Value::is_number);
        detail
            .value
            .as_ref()
            .and_then(Value::as_f64)
            .unwrap_or(default)
    }

    /// Evaluate a flag with an arbitrary JSON value.
    pub fn json_variation(&self, flag_key: &str, user: &User, default: Value) -> Value {
        self.variation(flag_key, user, default)
    }

    /// Evaluate with a result type check. A value of the wrong type is
    /// replaced by the default under an `ERROR{WRONG_TYPE}` reason before
    /// the feature event is produced.
    fn typed_variation(
        &self,
        flag_key: &str,
        user: &User,
        default: Value,
        type_check: fn(&Value) -> bool,
    ) -> Detail {
        let factory = EventFactory::new(false);
        let (detail, flag) = self.evaluate_with_store(flag_key, user, &factory);

        let detail = match &detail.value {
            Some(value) if !type_check(value) => {
                log::warn!(
                    target: "flagstream",
                    "flag {flag_key:?} evaluated to {value}, which is not the requested type; serving default"
                );
                Detail::error(ErrorKind::WrongType)
            }
            _ => detail,
        }
        .or_default(default.clone());

        self.events.send_event(factory.feature_event(
            flag_key,
            flag.as_ref(),
            user,
            &detail,
            Some(default),
        ));
        detail
    }

    /// The state of all flags for a user, in a form suitable for
    /// bootstrapping client-side SDKs.
    pub fn all_flags_state(&self, user: &User, options: FlagsStateOptions) -> FlagsState {
        if !self.initialized() {
            log::warn!(target: "flagstream", "all_flags_state() called before initialization");
            return FlagsState::new(false);
        }

        let factory = EventFactory::new(options.with_reasons);
        let mut state = FlagsState::new(true);
        for (key, item) in self.store.all(DataKind::Features) {
            let Item::Flag(flag) = item else { continue };
            if options.client_side_only && !flag.client_side {
                continue;
            }

            // Bulk snapshots never feed the analytics pipeline: keep the
            // detail, drop the prerequisite events.
            let detail = self.evaluate_flag(&flag, user, &factory).detail;
            let include_details =
                !options.details_only_for_tracked_flags || flag.track_events;
            state.add_flag(
                &key,
                detail.value.clone(),
                FlagMetadata {
                    version: include_details.then_some(flag.version),
                    variation: detail.variation_index,
                    reason: (options.with_reasons && include_details)
                        .then(|| detail.reason.clone()),
                    track_events: flag.track_events,
                },
            );
        }
        state
    }

    /// Report a user to the analytics pipeline for indexing.
    pub fn identify(&self, user: &User) {
        if user.key.as_deref().map_or(true, str::is_empty) {
            log::warn!(target: "flagstream", "identify() called with a keyless user");
            return;
        }
        self.events
            .send_event(EventFactory::new(false).identify_event(user));
    }

    /// Send an application-defined analytics event.
    pub fn track(&self, event_name: &str, user: &User, data: Option<Value>) {
        if user.key.as_deref().map_or(true, str::is_empty) {
            log::warn!(target: "flagstream", "track() called with a keyless user");
            return;
        }
        self.events
            .send_event(EventFactory::new(false).custom_event(event_name, user, data));
    }

    /// Flush any buffered analytics events.
    pub fn flush(&self) {
        self.events.flush();
    }

    /// Shut down the client: tear down the update connection, release the
    /// store, and close the event sink. Idempotent; evaluation after close
    /// serves defaults.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.processor {
            Some(UpdateProcessor::Streaming(processor)) => processor.stop(),
            Some(UpdateProcessor::Polling(processor)) => processor.stop(),
            None => {}
        }
        self.events.flush();
        self.events.close();
        self.store.close();
    }

    /// Evaluate, fill in the default, and emit the evaluation's events.
    fn evaluate_and_record(
        &self,
        flag_key: &str,
        user: &User,
        default: Value,
        factory: &EventFactory,
    ) -> Detail {
        let (detail, flag) = self.evaluate_with_store(flag_key, user, factory);
        let detail = detail.or_default(default.clone());

        self.events.send_event(factory.feature_event(
            flag_key,
            flag.as_ref(),
            user,
            &detail,
            Some(default),
        ));
        detail
    }

    fn evaluate_with_store(
        &self,
        flag_key: &str,
        user: &User,
        factory: &EventFactory,
    ) -> (Detail, Option<FeatureFlag>) {
        if !self.initialized() {
            log::warn!(
                target: "flagstream",
                "evaluating {flag_key:?} before the client has received rule data"
            );
            return (Detail::error(ErrorKind::ClientNotReady), None);
        }

        let Some(flag) = store::get_flag(self.store.as_ref(), flag_key) else {
            if !self.offline {
                log::info!(target: "flagstream", "unknown feature flag {flag_key:?}, serving default");
            }
            return (Detail::error(ErrorKind::FlagNotFound), None);
        };

        let result = self.evaluate_flag(&flag, user, factory);
        for event in result.events {
            self.events.send_event(event);
        }
        (result.detail, Some(flag))
    }

    /// Run the evaluation engine, containing any panic as an `EXCEPTION`
    /// result. Callers decide what to do with the returned prerequisite
    /// events; the engine itself never touches the analytics pipeline.
    fn evaluate_flag(
        &self,
        flag: &FeatureFlag,
        user: &User,
        factory: &EventFactory,
    ) -> eval::EvalResult {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            eval::evaluate(self.store.as_ref(), flag, user, factory)
        }));
        match outcome {
            Ok(result) => {
                if let Some(error) = &result.error {
                    log::warn!(
                        target: "flagstream",
                        "error evaluating flag {:?}: {error}", flag.key
                    );
                }
                result
            }
            Err(_panic) => {
                log::error!(
                    target: "flagstream",
                    "internal error evaluating flag {:?}", flag.key
                );
                eval::EvalResult {
                    detail: Detail::error(ErrorKind::Exception),
                    events: Vec::new(),
                    error: None,
                }
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::{json, Value};

    use super::*;
    use crate::detail::Reason;
    use crate::events::Event;
    use crate::store::{AllData, DataKind, InMemoryDataStore};

    struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        fn new() -> Arc<RecordingSink> {
            Arc::new(RecordingSink {
                events: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut self.events.lock().unwrap())
        }
    }

    impl EventSink for RecordingSink {
        fn send_event(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
        fn flush(&self) {}
        fn close(&self) {}
    }

    fn seeded_store(flags: Vec<Value>) -> Arc<InMemoryDataStore> {
        let store = Arc::new(InMemoryDataStore::new());
        let mut items = std::collections::HashMap::new();
        for flag in flags {
            let descriptor = DataKind::Features.parse_item(flag).unwrap();
            let key = descriptor.item.as_ref().unwrap().key().to_owned();
            items.insert(key, descriptor);
        }
        let mut data = AllData::new();
        data.insert(DataKind::Features, items);
        data.insert(DataKind::Segments, Default::default());
        store.init(data);
        store
    }

    fn client_over(flags: Vec<Value>, sink: Arc<RecordingSink>) -> Client {
        Config::from_sdk_key("sdk-key")
            .use_external_store(true)
            .store(seeded_store(flags))
            .event_sink(sink)
            .to_client()
            .unwrap()
    }

    fn bool_flag(key: &str, on: bool) -> Value {
        json!({
            "key": key, "version": 1, "on": on, "offVariation": 1,
            "fallthrough": {"variation": 0},
            "variations": [true, false],
            "trackEvents": true
        })
    }

    #[test]
    fn construction_rejects_bad_configuration() {
        assert!(matches!(
            Config::from_sdk_key("").offline(true).to_client(),
            Err(crate::Error::EmptySdkKey)
        ));
        assert!(matches!(
            Config::from_sdk_key("key").base_uri("%%%").offline(true).to_client(),
            Err(crate::Error::InvalidBaseUri(_))
        ));
    }

    #[test]
    fn offline_client_is_ready_and_serves_defaults() {
        let client = Config::from_sdk_key("sdk-key")
            .offline(true)
            .to_client()
            .unwrap();

        assert!(client.initialized());
        client.wait_for_initialization().unwrap();
        assert_eq!(
            client.variation("anything", &User::with_key("u"), json!("fallback")),
            json!("fallback")
        );
        assert!(!client.bool_variation("anything", &User::with_key("u"), false));
    }

    #[test]
    fn uninitialized_external_store_is_client_not_ready() {
        let client = Config::from_sdk_key("sdk-key")
            .use_external_store(true)
            .store(Arc::new(InMemoryDataStore::new()))
            .to_client()
            .unwrap();

        assert!(!client.initialized());
        let detail = client.variation_detail("f", &User::with_key("u"), json!(1));
        assert_eq!(detail.value, Some(json!(1)));
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::ClientNotReady
            }
        );
    }

    #[test]
    fn evaluates_flags_from_the_store() {
        let _ = env_logger::builder().is_test(true).try_init();

        let sink = RecordingSink::new();
        let client = client_over(vec![bool_flag("on-flag", true)], sink);

        assert!(client.initialized());
        assert!(client.bool_variation("on-flag", &User::with_key("u"), false));

        let detail = client.variation_detail("on-flag", &User::with_key("u"), json!(false));
        assert_eq!(detail.value, Some(json!(true)));
        assert_eq!(detail.variation_index, Some(0));
        assert_eq!(detail.reason, Reason::Fallthrough);
    }

    #[test]
    fn missing_flag_serves_default_with_reason() {
        let sink = RecordingSink::new();
        let client = client_over(vec![], sink);

        let detail = client.variation_detail("ghost", &User::with_key("u"), json!("d"));
        assert_eq!(detail.value, Some(json!("d")));
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::FlagNotFound
            }
        );
    }

    #[test]
    fn wrong_type_serves_default() {
        let sink = RecordingSink::new();
        let client = client_over(vec![bool_flag("bool-flag", true)], sink);

        assert_eq!(
            client.string_variation("bool-flag", &User::with_key("u"), "dft"),
            "dft"
        );
        assert_eq!(
            client.number_variation("bool-flag", &User::with_key("u"), 3.5),
            3.5
        );
    }

    #[test]
    fn variation_emits_a_feature_event() {
        let sink = RecordingSink::new();
        let client = client_over(vec![bool_flag("on-flag", true)], sink.clone());

        client.variation("on-flag", &User::with_key("u"), json!(false));
        let events = sink.take();
        assert_eq!(events.len(), 1);
        let Event::Feature {
            key,
            value,
            default,
            reason,
            track_events,
            ..
        } = &events[0]
        else {
            panic!("expected feature event");
        };
        assert_eq!(key, "on-flag");
        assert_eq!(value, &Some(json!(true)));
        assert_eq!(default, &Some(json!(false)));
        assert_eq!(reason, &None);
        assert!(track_events);
    }

    #[test]
    fn prerequisite_evaluations_emit_events_too() {
        let sink = RecordingSink::new();
        let parent = json!({
            "key": "parent", "version": 1, "on": true, "offVariation": 1,
            "prerequisites": [{"key": "child", "variation": 0}],
            "fallthrough": {"variation": 0},
            "variations": [true, false]
        });
        let client = client_over(vec![parent, bool_flag("child", true)], sink.clone());

        client.variation("parent", &User::with_key("u"), json!(false));
        let events = sink.take();
        assert_eq!(events.len(), 2);
        let Event::Feature { key, prereq_of, .. } = &events[0] else {
            panic!("expected feature event");
        };
        assert_eq!(key, "child");
        assert_eq!(prereq_of.as_deref(), Some("parent"));
        let Event::Feature { key, prereq_of, .. } = &events[1] else {
            panic!("expected feature event");
        };
        assert_eq!(key, "parent");
        assert_eq!(prereq_of, &None);
    }

    #[test]
    fn all_flags_state_snapshots_every_flag() {
        let sink = RecordingSink::new();
        // "gated" has a prerequisite, so snapshotting it evaluates "a" too.
        let gated = json!({
            "key": "gated", "version": 1, "on": true, "offVariation": 1,
            "prerequisites": [{"key": "a", "variation": 0}],
            "fallthrough": {"variation": 0},
            "variations": [true, false]
        });
        let client = client_over(
            vec![bool_flag("a", true), bool_flag("b", false), gated],
            sink.clone(),
        );

        let state = client.all_flags_state(&User::with_key("u"), FlagsStateOptions::default());
        assert!(state.valid());
        assert_eq!(state.value("a"), Some(&json!(true)));
        assert_eq!(state.value("b"), Some(&json!(false)));
        assert_eq!(state.value("gated"), Some(&json!(true)));
        // Bulk evaluation does not feed the analytics pipeline, not even
        // with the prerequisite evaluations it performed along the way.
        assert!(sink.take().is_empty());
    }

    #[test]
    fn all_flags_state_with_reasons_round_trips() {
        let sink = RecordingSink::new();
        let client = client_over(vec![bool_flag("a", true)], sink);

        let state = client.all_flags_state(
            &User::with_key("u"),
            FlagsStateOptions {
                with_reasons: true,
                ..Default::default()
            },
        );
        assert_eq!(
            state.metadata("a").unwrap().reason,
            Some(Reason::Fallthrough)
        );

        let json = serde_json::to_string(&state).unwrap();
        let back: FlagsState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn all_flags_state_filters_client_side_flags() {
        let sink = RecordingSink::new();
        let mut visible = bool_flag("visible", true);
        visible["clientSide"] = json!(true);
        let client = client_over(vec![visible, bool_flag("server-only", true)], sink);

        let state = client.all_flags_state(
            &User::with_key("u"),
            FlagsStateOptions {
                client_side_only: true,
                ..Default::default()
            },
        );
        assert_eq!(state.value("visible"), Some(&json!(true)));
        assert_eq!(state.value("server-only"), None);
    }

    #[test]
    fn track_and_identify_reach_the_sink() {
        let sink = RecordingSink::new();
        let client = client_over(vec![], sink.clone());
        let user = User::with_key("u");

        client.identify(&user);
        client.track("clicked", &user, Some(json!({"button": "buy"})));
        client.identify(&User::default()); // keyless: dropped

        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::Identify { key, .. } if key == "u"));
        assert!(matches!(&events[1], Event::Custom { key, .. } if key == "clicked"));
    }

    #[test]
    fn close_is_idempotent() {
        let client = Config::from_sdk_key("sdk-key")
            .offline(true)
            .to_client()
            .unwrap();
        client.close();
        client.close();
        // Evaluation after close still serves the default.
        assert_eq!(
            client.variation("f", &User::with_key("u"), json!(7)),
            json!(7)
        );
    }

    #[test]
    fn store_updates_are_visible_to_later_evaluations() {
        let store = seeded_store(vec![bool_flag("f", true)]);
        let client = Config::from_sdk_key("sdk-key")
            .use_external_store(true)
            .store(store.clone())
            .to_client()
            .unwrap();

        assert!(client.bool_variation("f", &User::with_key("u"), false));

        let mut updated = bool_flag("f", false);
        updated["version"] = json!(2);
        store.upsert(
            DataKind::Features,
            DataKind::Features.parse_item(updated).unwrap(),
        );
        assert!(!client.bool_variation("f", &User::with_key("u"), true));

        store.delete(DataKind::Features, "f", 3);
        let detail = client.variation_detail("f", &User::with_key("u"), json!("gone"));
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::FlagNotFound
            }
        );
    }
}
