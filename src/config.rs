//! Client configuration.
use std::sync::Arc;
use std::time::Duration;

use crate::events::{DiagnosticsSink, EventSink};
use crate::polling::PollingProcessorConfig;
use crate::requestor::HttpConfig;
use crate::store::DataStore;
use crate::streaming::StreamingProcessorConfig;
use crate::{Client, Error, Result};

/// Configuration for [`Client`].
///
/// # Examples
/// ```no_run
/// # use flagstream::Config;
/// let client = Config::from_sdk_key("sdk-key")
///     .stream(true)
///     .to_client()
///     .unwrap();
/// ```
pub struct Config {
    pub(crate) sdk_key: String,
    pub(crate) base_uri: String,
    pub(crate) stream_uri: String,
    pub(crate) stream: bool,
    pub(crate) stream_initial_reconnect_delay: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) timeout: Duration,
    pub(crate) offline: bool,
    pub(crate) use_external_store: bool,
    pub(crate) send_events: bool,
    pub(crate) diagnostic_opt_out: bool,
    pub(crate) wrapper_name: Option<String>,
    pub(crate) wrapper_version: Option<String>,
    pub(crate) proxy: Option<reqwest::Proxy>,
    pub(crate) ca_certificates: Vec<reqwest::Certificate>,
    pub(crate) identity: Option<reqwest::Identity>,
    pub(crate) store: Option<Arc<dyn DataStore>>,
    pub(crate) event_sink: Option<Arc<dyn EventSink>>,
    pub(crate) diagnostics: Option<Arc<dyn DiagnosticsSink>>,
}

impl Config {
    /// Default base URI for REST calls.
    pub const DEFAULT_BASE_URI: &'static str = "https://sdk.flagstream.io";
    /// Default URI for the event stream.
    pub const DEFAULT_STREAM_URI: &'static str = "https://stream.flagstream.io";

    /// Create a default configuration using the specified SDK key.
    ///
    /// ```
    /// # use flagstream::Config;
    /// Config::from_sdk_key("sdk-key");
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>) -> Config {
        Config {
            sdk_key: sdk_key.into(),
            base_uri: Config::DEFAULT_BASE_URI.to_owned(),
            stream_uri: Config::DEFAULT_STREAM_URI.to_owned(),
            stream: true,
            stream_initial_reconnect_delay:
                StreamingProcessorConfig::DEFAULT_INITIAL_RECONNECT_DELAY,
            poll_interval: PollingProcessorConfig::MIN_POLL_INTERVAL,
            timeout: HttpConfig::DEFAULT_TIMEOUT,
            offline: false,
            use_external_store: false,
            send_events: true,
            diagnostic_opt_out: false,
            wrapper_name: None,
            wrapper_version: None,
            proxy: None,
            ca_certificates: Vec::new(),
            identity: None,
            store: None,
            event_sink: None,
            diagnostics: None,
        }
    }

    /// Override the base URI for REST calls. Clients should use the
    /// default in most cases.
    pub fn base_uri(mut self, base_uri: impl Into<String>) -> Config {
        self.base_uri = base_uri.into();
        self
    }

    /// Override the event stream URI. Clients should use the default in
    /// most cases.
    pub fn stream_uri(mut self, stream_uri: impl Into<String>) -> Config {
        self.stream_uri = stream_uri.into();
        self
    }

    /// Choose between streaming updates (default) and polling.
    pub fn stream(mut self, stream: bool) -> Config {
        self.stream = stream;
        self
    }

    /// Delay before the first stream reconnect attempt. Accepts any
    /// `Duration`, so second and millisecond granularity are equally at
    /// home: `Duration::from_millis(500)`.
    pub fn stream_initial_reconnect_delay(mut self, delay: Duration) -> Config {
        self.stream_initial_reconnect_delay = delay;
        self
    }

    /// Interval between full-snapshot polls when streaming is disabled.
    /// Values below 30 seconds are raised to 30 seconds.
    pub fn poll_interval(mut self, interval: Duration) -> Config {
        self.poll_interval = interval;
        self
    }

    /// Per-request timeout for REST calls and the stream connect phase.
    pub fn timeout(mut self, timeout: Duration) -> Config {
        self.timeout = timeout;
        self
    }

    /// Run with no network activity at all. The client reports ready
    /// immediately and every evaluation serves the caller's default.
    pub fn offline(mut self, offline: bool) -> Config {
        self.offline = offline;
        self
    }

    /// Trust an externally populated store instead of connecting to the
    /// control service. Use together with [`Config::store`] and a store
    /// backend some other process writes to.
    pub fn use_external_store(mut self, use_external_store: bool) -> Config {
        self.use_external_store = use_external_store;
        self
    }

    /// Disable analytics event delivery.
    pub fn send_events(mut self, send_events: bool) -> Config {
        self.send_events = send_events;
        self
    }

    /// Disable diagnostics recording.
    pub fn diagnostic_opt_out(mut self, diagnostic_opt_out: bool) -> Config {
        self.diagnostic_opt_out = diagnostic_opt_out;
        self
    }

    /// Identify a wrapper library on all requests, e.g. `("proxy", "1.2")`.
    pub fn wrapper(
        mut self,
        name: impl Into<String>,
        version: impl Into<Option<String>>,
    ) -> Config {
        self.wrapper_name = Some(name.into());
        self.wrapper_version = version.into();
        self
    }

    /// Route all requests through the given proxy.
    pub fn proxy(mut self, proxy: reqwest::Proxy) -> Config {
        self.proxy = Some(proxy);
        self
    }

    /// Trust an additional CA certificate when connecting.
    pub fn add_ca_certificate(mut self, certificate: reqwest::Certificate) -> Config {
        self.ca_certificates.push(certificate);
        self
    }

    /// Present a client certificate when connecting.
    pub fn identity(mut self, identity: reqwest::Identity) -> Config {
        self.identity = Some(identity);
        self
    }

    /// Use a custom store backend instead of the default in-memory one.
    pub fn store(mut self, store: Arc<dyn DataStore>) -> Config {
        self.store = Some(store);
        self
    }

    /// Deliver analytics events to the given sink.
    pub fn event_sink(mut self, event_sink: Arc<dyn EventSink>) -> Config {
        self.event_sink = Some(event_sink);
        self
    }

    /// Record diagnostics with the given sink.
    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Config {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Create a new [`Client`] using this configuration.
    ///
    /// # Errors
    ///
    /// Configuration errors are fatal and reported here: an empty SDK key
    /// or an unparsable URI never produces a half-working client.
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }

    /// Validate construction-time invariants and normalize the URIs.
    pub(crate) fn validate(&mut self) -> Result<()> {
        if self.sdk_key.is_empty() {
            return Err(Error::EmptySdkKey);
        }
        self.base_uri = normalize_uri(&self.base_uri).map_err(Error::InvalidBaseUri)?;
        self.stream_uri = normalize_uri(&self.stream_uri).map_err(Error::InvalidStreamUri)?;
        Ok(())
    }

    /// The wrapper identifier header value, `name` or `name/version`.
    pub(crate) fn wrapper_header(&self) -> Option<String> {
        let name = self.wrapper_name.as_ref()?;
        Some(match &self.wrapper_version {
            Some(version) => format!("{name}/{version}"),
            None => name.clone(),
        })
    }

    pub(crate) fn http_config(&self) -> HttpConfig {
        HttpConfig {
            sdk_key: self.sdk_key.clone(),
            wrapper: self.wrapper_header(),
            timeout: self.timeout,
            proxy: self.proxy.clone(),
            ca_certificates: self.ca_certificates.clone(),
            identity: self.identity.clone(),
        }
    }
}

/// Parse and strip any trailing slash so endpoint paths concatenate
/// cleanly.
fn normalize_uri(uri: &str) -> std::result::Result<String, url::ParseError> {
    let _ = url::Url::parse(uri)?;
    Ok(uri.trim_end_matches('/').to_owned())
}
