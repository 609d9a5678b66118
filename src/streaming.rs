//! The streaming update processor.
//!
//! Owns exactly one server-sent-events connection to the control service.
//! Events seed and mutate the store; the connection is retried with
//! backoff on recoverable errors and shut down permanently on errors that
//! retrying cannot fix (for example a rejected SDK key).
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{self, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::watch;

use crate::error::is_http_error_recoverable;
use crate::events::DiagnosticsSink;
use crate::polling::jitter;
use crate::requestor::{HttpConfig, Requestor};
use crate::signal::InitSignal;
use crate::store::{parse_all_data, DataKind, DataStore};
use crate::{Error, Result};

/// Path of the streaming endpoint, relative to the stream URI.
const STREAM_ENDPOINT: &str = "/all";

/// Reconnect delay doubles per failed attempt up to this cap.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// A connection that stayed healthy this long resets the backoff.
const RECONNECT_RESET_THRESHOLD: Duration = Duration::from_secs(60);

/// A stream with no activity for this long is considered dropped. The
/// control service sends heartbeat comments far more often.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Configuration for [`StreamingProcessor`].
#[derive(Clone)]
pub struct StreamingProcessorConfig {
    pub stream_uri: String,
    pub http: HttpConfig,
    /// Delay before the first reconnect attempt; doubles per consecutive
    /// failure. Defaults to
    /// [`StreamingProcessorConfig::DEFAULT_INITIAL_RECONNECT_DELAY`].
    pub initial_reconnect_delay: Duration,
}

impl StreamingProcessorConfig {
    /// Default value for
    /// [`StreamingProcessorConfig::initial_reconnect_delay`].
    pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
}

/// Callback observing errors that occur after initialization completed.
pub type ErrorListener = Arc<dyn Fn(&Error) + Send + Sync>;

/// The streaming update processor.
///
/// Spawns a thread that connects to the control service's event stream and
/// applies `put`/`patch`/`delete` events (and their indirect variants) to
/// the store as they arrive.
pub struct StreamingProcessor {
    join_handle: std::thread::JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    init: Arc<InitSignal>,
}

impl StreamingProcessor {
    /// Start the streaming thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start(
        config: StreamingProcessorConfig,
        requestor: Requestor,
        store: Arc<dyn DataStore>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        error_listener: Option<ErrorListener>,
    ) -> std::io::Result<StreamingProcessor> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let init = Arc::new(InitSignal::new());

        let join_handle = {
            let init = Arc::clone(&init);

            std::thread::Builder::new()
                .name("flagstream-stream".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(runtime) => runtime,
                            Err(err) => {
                                init.offer(Err(Error::from(err)));
                                return;
                            }
                        };

                        let mut connection = StreamConnection {
                            config,
                            requestor,
                            store,
                            diagnostics,
                            error_listener,
                            init: Arc::clone(&init),
                            shutdown: shutdown_rx,
                        };
                        runtime.block_on(connection.run());
                    }));

                    if result.is_err() {
                        init.offer(Err(Error::ProcessorPanicked));
                    } else {
                        init.offer(Err(Error::ClosedBeforeInitialization));
                    }
                })?
        };

        Ok(StreamingProcessor {
            join_handle,
            shutdown,
            init,
        })
    }

    /// Block until the first snapshot has been applied, or the stream
    /// failed permanently.
    pub fn wait_for_initialization(&self) -> Result<()> {
        self.init.wait()
    }

    /// Whether a snapshot has been applied.
    pub fn initialized(&self) -> bool {
        self.init.ready()
    }

    /// Tear down the connection without waiting for the thread to exit.
    pub fn stop(&self) {
        // Error means the thread has already exited.
        let _ = self.shutdown.send(true);
    }

    /// Tear down the connection and block waiting for the thread to exit.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::ProcessorPanicked)?;
        Ok(())
    }
}

/// State for one processor's connection lifecycle.
struct StreamConnection {
    config: StreamingProcessorConfig,
    requestor: Requestor,
    store: Arc<dyn DataStore>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    error_listener: Option<ErrorListener>,
    init: Arc<InitSignal>,
    shutdown: watch::Receiver<bool>,
}

/// Why a healthy connection stopped yielding events.
enum StreamExit {
    /// `stop()` was called; no reconnect.
    Shutdown,
    /// The connection dropped; reconnect.
    Dropped(Error),
}

impl StreamConnection {
    async fn run(&mut self) {
        let client = match self.config.http.stream_client() {
            Ok(client) => client,
            Err(err) => {
                self.init.offer(Err(Error::from(err)));
                return;
            }
        };
        let url = format!("{}{}", self.config.stream_uri, STREAM_ENDPOINT);

        let mut base_delay = self.config.initial_reconnect_delay;
        let mut delay = base_delay;

        loop {
            if *self.shutdown.borrow() {
                return;
            }

            let attempt_started = chrono::Utc::now();
            let attempt_timer = Instant::now();
            match connect(&client, &url).await {
                Ok(response) => {
                    self.diagnostics.record_stream_init(
                        attempt_started,
                        false,
                        attempt_timer.elapsed(),
                    );
                    log::info!(target: "flagstream", "connected to event stream");

                    let opened = Instant::now();
                    match self.read_events(response, &mut base_delay).await {
                        StreamExit::Shutdown => return,
                        StreamExit::Dropped(err) => {
                            log::warn!(target: "flagstream", "event stream interrupted, will reconnect: {err}");
                            self.report(&err);
                        }
                    }
                    if opened.elapsed() >= RECONNECT_RESET_THRESHOLD {
                        delay = base_delay;
                    }
                }
                Err(err) if !err.is_recoverable() => {
                    self.diagnostics.record_stream_init(
                        attempt_started,
                        true,
                        attempt_timer.elapsed(),
                    );
                    log::error!(target: "flagstream", "event stream failed permanently: {err}");
                    if !self.init.offer(Err(err.clone())) {
                        self.report(&err);
                    }
                    return;
                }
                Err(err) => {
                    self.diagnostics.record_stream_init(
                        attempt_started,
                        true,
                        attempt_timer.elapsed(),
                    );
                    log::warn!(target: "flagstream", "event stream connection failed, will retry: {err}");
                    self.report(&err);
                }
            }

            let wait = jitter(delay, delay / 2);
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown.changed() => return,
            }
        }
    }

    /// Pump one established connection until it drops or we're stopped.
    async fn read_events(
        &mut self,
        mut response: reqwest::Response,
        base_delay: &mut Duration,
    ) -> StreamExit {
        let mut parser = EventParser::new();
        loop {
            let chunk = tokio::select! {
                _ = self.shutdown.changed() => return StreamExit::Shutdown,
                chunk = tokio::time::timeout(READ_TIMEOUT, response.chunk()) => chunk,
            };
            let bytes = match chunk {
                Err(_elapsed) => {
                    return StreamExit::Dropped(Error::from(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "no stream activity within the read timeout",
                    )))
                }
                Ok(Err(err)) => return StreamExit::Dropped(Error::from(err)),
                Ok(Ok(None)) => {
                    return StreamExit::Dropped(Error::from(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "server closed the event stream",
                    )))
                }
                Ok(Ok(Some(bytes))) => bytes,
            };

            for event in parser.push(&bytes) {
                self.handle_message(&event).await;
            }
            // Honor a server-sent reconnection-delay directive.
            if let Some(retry) = parser.retry_directive() {
                *base_delay = retry;
            }
        }
    }

    async fn handle_message(&mut self, message: &SseMessage) {
        match self.apply_message(message).await {
            Ok(applied_snapshot) => {
                if applied_snapshot {
                    self.init.offer(Ok(()));
                }
            }
            Err(err) => {
                // A bad event body is dropped; the connection survives.
                log::error!(
                    target: "flagstream",
                    "error handling {:?} event: {err}", message.name
                );
                self.report(&err);
            }
        }
    }

    /// Apply one stream message to the store. Returns whether a full
    /// snapshot was applied (which is what completes initialization).
    async fn apply_message(&mut self, message: &SseMessage) -> Result<bool> {
        match message.name.as_str() {
            "put" => {
                let body: PutMessage = serde_json::from_str(&message.data)?;
                self.store.init(parse_all_data(body.data)?);
                log::debug!(target: "flagstream", "applied full rule data snapshot");
                Ok(true)
            }
            "patch" => {
                let body: PatchMessage = serde_json::from_str(&message.data)?;
                match DataKind::for_path(&body.path) {
                    Some((kind, _key)) => {
                        self.store.upsert(kind, kind.parse_item(body.data)?);
                    }
                    None => {
                        log::debug!(
                            target: "flagstream",
                            "ignoring patch for unrecognized path {:?}", body.path
                        );
                    }
                }
                Ok(false)
            }
            "delete" => {
                let body: DeleteMessage = serde_json::from_str(&message.data)?;
                match DataKind::for_path(&body.path) {
                    Some((kind, key)) => {
                        self.store.delete(kind, key, body.version);
                    }
                    None => {
                        log::debug!(
                            target: "flagstream",
                            "ignoring delete for unrecognized path {:?}", body.path
                        );
                    }
                }
                Ok(false)
            }
            "indirect/put" => {
                let data = self.requestor.request_all_data().await?;
                self.store.init(data);
                Ok(true)
            }
            "indirect/patch" => {
                let path = message.data.trim();
                let (kind, key) = DataKind::for_path(path)
                    .ok_or_else(|| Error::UnknownDataPath(path.to_owned()))?;
                let item = self.requestor.request_object(kind, key).await?;
                self.store.upsert(kind, item);
                Ok(false)
            }
            other => {
                log::debug!(target: "flagstream", "ignoring unknown event {other:?}");
                Ok(false)
            }
        }
    }

    /// Pass a non-terminal error to the observer, if one is registered.
    fn report(&self, err: &Error) {
        if let Some(listener) = &self.error_listener {
            listener(err);
        }
    }
}

async fn connect(client: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    let response = client
        .get(url)
        .header(header::ACCEPT, HeaderValue::from_static("text/event-stream"))
        .send()
        .await?;

    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED => Err(Error::Unauthorized),
        status => {
            if is_http_error_recoverable(status) {
                log::warn!(target: "flagstream", "stream returned {status}, will retry");
            } else {
                log::error!(target: "flagstream", "stream returned {status}, giving up");
            }
            Err(Error::UnexpectedStatus(status))
        }
    }
}

#[derive(Debug, Deserialize)]
struct PutMessage {
    #[allow(dead_code)]
    #[serde(default)]
    path: Option<String>,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PatchMessage {
    path: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DeleteMessage {
    path: String,
    version: u64,
}

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseMessage {
    pub name: String,
    pub data: String,
}

/// Incremental parser for the `text/event-stream` wire format.
///
/// Chunks arrive with arbitrary boundaries; the parser buffers partial
/// lines and emits complete events as they are terminated by blank lines.
pub(crate) struct EventParser {
    buffer: Vec<u8>,
    event_name: String,
    data: String,
    retry: Option<Duration>,
}

impl EventParser {
    pub fn new() -> EventParser {
        EventParser {
            buffer: Vec::new(),
            event_name: String::new(),
            data: String::new(),
            retry: None,
        }
    }

    /// Feed one chunk; returns any events it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let rest = self.buffer.split_off(newline + 1);
            let mut line = std::mem::replace(&mut self.buffer, rest);
            line.pop(); // the newline itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.process_line(&String::from_utf8_lossy(&line), &mut events);
        }
        events
    }

    /// The most recent `retry:` directive, if the server sent one.
    pub fn retry_directive(&self) -> Option<Duration> {
        self.retry
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseMessage>) {
        if line.is_empty() {
            // Blank line dispatches the accumulated event, if any.
            if !self.data.is_empty() {
                let mut data = std::mem::take(&mut self.data);
                data.pop(); // trailing newline from the last data line
                let name = std::mem::take(&mut self.event_name);
                events.push(SseMessage {
                    name: if name.is_empty() {
                        "message".to_owned()
                    } else {
                        name
                    },
                    data,
                });
            }
            self.event_name.clear();
            return;
        }
        if line.starts_with(':') {
            // Comment, typically a keep-alive.
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_name = value.to_owned(),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "retry" => {
                if let Ok(millis) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(millis));
                }
            }
            // "id" and any unknown fields are ignored.
            _ => {}
        }
    }
}


#[cfg(test)]
mod message_handling_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::watch;

    use super::{SseMessage, StreamConnection, StreamingProcessorConfig};
    use crate::events::NoopDiagnosticsSink;
    use crate::requestor::{HttpConfig, Requestor, RequestorConfig};
    use crate::signal::InitSignal;
    use crate::store::{DataKind, DataStore, InMemoryDataStore};

    fn connection(store: Arc<InMemoryDataStore>) -> StreamConnection {
        let (shutdown_tx, shutdown) = watch::channel(false);
        // Keep the channel open for the duration of the test process.
        std::mem::forget(shutdown_tx);
        StreamConnection {
            config: StreamingProcessorConfig {
                stream_uri: "https://stream.example.com".to_owned(),
                http: HttpConfig::new("sdk-key"),
                initial_reconnect_delay:
                    StreamingProcessorConfig::DEFAULT_INITIAL_RECONNECT_DELAY,
            },
            requestor: Requestor::new(RequestorConfig {
                base_uri: "https://sdk.example.com".to_owned(),
                http: HttpConfig::new("sdk-key"),
            }),
            store,
            diagnostics: Arc::new(NoopDiagnosticsSink),
            error_listener: None,
            init: Arc::new(InitSignal::new()),
            shutdown,
        }
    }

    fn apply(conn: &mut StreamConnection, name: &str, data: &str) -> crate::Result<bool> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(conn.apply_message(&SseMessage {
            name: name.to_owned(),
            data: data.to_owned(),
        }))
    }

    #[test]
    fn put_replaces_store_contents_and_completes_init() {
        let store = Arc::new(InMemoryDataStore::new());
        let mut conn = connection(store.clone());

        let applied_snapshot = apply(
            &mut conn,
            "put",
            r#"{"path": "/", "data": {
                "flags": {"f": {"key": "f", "version": 1, "on": true,
                                 "fallthrough": {"variation": 0}, "variations": [true]}},
                "segments": {"s": {"key": "s", "version": 1}}
            }}"#,
        )
        .unwrap();

        assert!(applied_snapshot);
        assert!(store.initialized());
        assert!(store.get(DataKind::Features, "f").is_some());
        assert!(store.get(DataKind::Segments, "s").is_some());
    }

    #[test]
    fn patch_routes_by_path_prefix() {
        let store = Arc::new(InMemoryDataStore::new());
        let mut conn = connection(store.clone());

        apply(
            &mut conn,
            "patch",
            r#"{"path": "/flags/f", "data":
                {"key": "f", "version": 2, "on": false, "variations": []}}"#,
        )
        .unwrap();
        assert_eq!(store.get(DataKind::Features, "f").unwrap().version(), 2);

        apply(
            &mut conn,
            "patch",
            r#"{"path": "/segments/s", "data": {"key": "s", "version": 3}}"#,
        )
        .unwrap();
        assert_eq!(store.get(DataKind::Segments, "s").unwrap().version(), 3);
    }

    #[test]
    fn patch_for_unknown_path_is_a_no_op() {
        let store = Arc::new(InMemoryDataStore::new());
        let mut conn = connection(store.clone());

        let result = apply(
            &mut conn,
            "patch",
            r#"{"path": "/espionage/x", "data": {"key": "x", "version": 1}}"#,
        );
        assert!(matches!(result, Ok(false)));
        assert!(store.all(DataKind::Features).is_empty());
    }

    #[test]
    fn delete_tombstones_the_item() {
        let store = Arc::new(InMemoryDataStore::new());
        let mut conn = connection(store.clone());

        apply(
            &mut conn,
            "patch",
            r#"{"path": "/flags/f", "data":
                {"key": "f", "version": 1, "on": true, "variations": []}}"#,
        )
        .unwrap();
        apply(&mut conn, "delete", r#"{"path": "/flags/f", "version": 2}"#).unwrap();

        assert_eq!(store.get(DataKind::Features, "f"), None);
        // A stale patch cannot bring it back.
        apply(
            &mut conn,
            "patch",
            r#"{"path": "/flags/f", "data":
                {"key": "f", "version": 1, "on": true, "variations": []}}"#,
        )
        .unwrap();
        assert_eq!(store.get(DataKind::Features, "f"), None);
    }

    #[test]
    fn malformed_json_is_an_error_but_not_fatal() {
        let store = Arc::new(InMemoryDataStore::new());
        let mut conn = connection(store.clone());

        assert!(apply(&mut conn, "put", "{definitely not json").is_err());
        assert!(apply(&mut conn, "patch", r#"{"path": "/flags/f"}"#).is_err());
        // The store is untouched and the connection object remains usable.
        assert!(!store.initialized());
        assert!(apply(
            &mut conn,
            "put",
            r#"{"data": {"flags": {}, "segments": {}}}"#
        )
        .unwrap());
        assert!(store.initialized());
    }

    #[test]
    fn unknown_event_names_are_ignored() {
        let store = Arc::new(InMemoryDataStore::new());
        let mut conn = connection(store.clone());
        assert!(matches!(apply(&mut conn, "party", "{}"), Ok(false)));
    }

    #[test]
    fn indirect_patch_with_unknown_path_is_surfaced() {
        let store = Arc::new(InMemoryDataStore::new());
        let mut conn = connection(store);
        let result = apply(&mut conn, "indirect/patch", "/espionage/x");
        assert!(matches!(result, Err(crate::Error::UnknownDataPath(_))));
    }

    #[test]
    fn reconnect_delay_doubles_up_to_the_cap() {
        let mut delay = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay);
            delay = (delay * 2).min(super::MAX_RECONNECT_DELAY);
        }
        assert_eq!(
            seen,
            [1, 2, 4, 8, 16, 30, 30].map(Duration::from_secs).to_vec()
        );
    }
}
