//! An HTTP client that fetches rule data from the control service on
//! demand: the full snapshot for polling and indirect `put` events, single
//! items for indirect `patch` events.
use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;

use crate::error::is_http_error_recoverable;
use crate::store::{parse_all_data, AllData, DataKind, ItemDescriptor};
use crate::{Error, Result};

/// Path of the full-snapshot endpoint, relative to the base URI.
const ALL_DATA_ENDPOINT: &str = "/sdk/latest-all";

/// Transport options shared by the requestor and the streaming connection.
///
/// Proxy and TLS material are accepted as prebuilt `reqwest` values; tunnel
/// construction itself is the HTTP stack's business.
#[derive(Clone)]
pub struct HttpConfig {
    pub sdk_key: String,
    pub wrapper: Option<String>,
    /// Per-request timeout for REST calls. Not applied to the streaming
    /// connection, which is long-lived by design.
    pub timeout: Duration,
    pub proxy: Option<reqwest::Proxy>,
    pub ca_certificates: Vec<reqwest::Certificate>,
    pub identity: Option<reqwest::Identity>,
}

impl HttpConfig {
    /// Default value for [`HttpConfig::timeout`].
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(sdk_key: impl Into<String>) -> HttpConfig {
        HttpConfig {
            sdk_key: sdk_key.into(),
            wrapper: None,
            timeout: HttpConfig::DEFAULT_TIMEOUT,
            proxy: None,
            ca_certificates: Vec::new(),
            identity: None,
        }
    }

    fn client_builder(&self) -> reqwest::ClientBuilder {
        let mut builder = reqwest::Client::builder()
            .default_headers(default_headers(&self.sdk_key, self.wrapper.as_deref()));
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(proxy.clone());
        }
        for certificate in &self.ca_certificates {
            builder = builder.add_root_certificate(certificate.clone());
        }
        if let Some(identity) = &self.identity {
            builder = builder.identity(identity.clone());
        }
        builder
    }

    /// A client for one-shot REST requests.
    pub(crate) fn rest_client(&self) -> reqwest::Result<reqwest::Client> {
        self.client_builder().timeout(self.timeout).build()
    }

    /// A client for the event stream: bounded connect, unbounded read.
    pub(crate) fn stream_client(&self) -> reqwest::Result<reqwest::Client> {
        self.client_builder().connect_timeout(self.timeout).build()
    }
}

#[derive(Clone)]
pub struct RequestorConfig {
    pub base_uri: String,
    pub http: HttpConfig,
}

/// A client that fetches rule data from the control service.
///
/// Identical requests are naturally serialised: all operations go through
/// `&mut self`, and a repeat of a previously answered request is satisfied
/// by a conditional fetch against the local `ETag` cache.
pub struct Requestor {
    // Client holds a connection pool internally, so we're reusing the
    // client between requests.
    client: reqwest::Client,
    config: RequestorConfig,
    /// Per-URI ETag and the body it validated, for conditional requests.
    etags: HashMap<String, (HeaderValue, Vec<u8>)>,
    /// If we receive a 401 Unauthorized error during a request, the SDK
    /// key is not valid. We cache this error so we don't issue additional
    /// requests to the server.
    unauthorized: bool,
}

impl Requestor {
    pub fn new(config: RequestorConfig) -> Requestor {
        // Panics only if the TLS backend cannot be initialized, the same
        // failure mode as `reqwest::Client::new()`.
        let client = config
            .http
            .rest_client()
            .expect("HTTP client initialization should not fail");

        Requestor {
            client,
            config,
            etags: HashMap::new(),
            unauthorized: false,
        }
    }

    /// Fetch the full `{flags, segments}` snapshot.
    pub async fn request_all_data(&mut self) -> Result<AllData> {
        let url = format!("{}{}", self.config.base_uri, ALL_DATA_ENDPOINT);
        let bytes = self.request_bytes(&url).await?;
        parse_all_data(serde_json::from_slice(&bytes)?)
    }

    /// Fetch a single item of the given kind.
    pub async fn request_object(&mut self, kind: DataKind, key: &str) -> Result<ItemDescriptor> {
        let url = format!("{}{}{}", self.config.base_uri, kind.stream_api_path(), key);
        let bytes = self.request_bytes(&url).await?;
        kind.parse_item(serde_json::from_slice(&bytes)?)
    }

    async fn request_bytes(&mut self, url: &str) -> Result<Vec<u8>> {
        if self.unauthorized {
            return Err(Error::Unauthorized);
        }

        log::debug!(target: "flagstream", "requesting {url}");
        let mut request = self.client.get(url);
        if let Some((etag, _)) = self.etags.get(url) {
            request = request.header(header::IF_NONE_MATCH, etag.clone());
        }
        let response = request.send().await?;

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                // Serve the body the cached ETag validated.
                let (_, body) = self
                    .etags
                    .get(url)
                    .ok_or_else(|| Error::UnexpectedStatus(StatusCode::NOT_MODIFIED))?;
                log::debug!(target: "flagstream", "{url} not modified, using cached body");
                Ok(body.clone())
            }
            status if status.is_success() => {
                let etag = response.headers().get(header::ETAG).cloned();
                let body = response.bytes().await?.to_vec();
                match etag {
                    Some(etag) => {
                        self.etags.insert(url.to_owned(), (etag, body.clone()));
                    }
                    None => {
                        self.etags.remove(url);
                    }
                }
                Ok(body)
            }
            StatusCode::UNAUTHORIZED => {
                log::warn!(target: "flagstream", "request was not authorized, check your SDK key");
                self.unauthorized = true;
                Err(Error::Unauthorized)
            }
            status => {
                if is_http_error_recoverable(status) {
                    log::warn!(target: "flagstream", "received {status} from {url}, will retry");
                } else {
                    log::error!(target: "flagstream", "received {status} from {url}, giving up");
                }
                Err(Error::UnexpectedStatus(status))
            }
        }
    }
}

/// Headers carried on every request to the control service, for both the
/// REST endpoints and the streaming connection.
pub(crate) fn default_headers(sdk_key: &str, wrapper: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(authorization) = HeaderValue::from_str(sdk_key) {
        headers.insert(header::AUTHORIZATION, authorization);
    }
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_static(concat!("FlagstreamClient/", env!("CARGO_PKG_VERSION"))),
    );
    if let Some(wrapper) = wrapper {
        if let Ok(value) = HeaderValue::from_str(wrapper) {
            headers.insert("x-flagstream-wrapper", value);
        }
    }
    headers
}
