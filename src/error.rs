use std::sync::Arc;

use reqwest::StatusCode;

/// Result type used throughout the SDK.
///
/// This is a standard Rust `Result` where the error variant is the
/// SDK-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the SDK.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// SDK key was empty. Raised at client construction.
    #[error("sdk_key must not be empty")]
    EmptySdkKey,

    /// Invalid base URI configuration.
    #[error("invalid base_uri configuration")]
    InvalidBaseUri(#[source] url::ParseError),

    /// Invalid stream URI configuration.
    #[error("invalid stream_uri configuration")]
    InvalidStreamUri(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid SDK key.
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,

    /// The server returned an HTTP status the SDK cannot act on.
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(StatusCode),

    /// An event arrived on the stream with a body that is not valid JSON,
    /// or whose JSON does not match the expected shape. The event is
    /// dropped and the connection survives.
    #[error("malformed event data on stream")]
    InvalidEventData(#[source] Arc<serde_json::Error>),

    /// A patch/delete event referenced a path no data kind claims.
    #[error("unrecognized data path {0:?}")]
    UnknownDataPath(String),

    /// Indicates that a background processor thread panicked. This should
    /// normally never happen.
    #[error("update processor thread panicked")]
    ProcessorPanicked,

    /// The update processor was shut down before it finished initializing.
    #[error("client closed before initialization completed")]
    ClosedBeforeInitialization,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::InvalidEventData(Arc::new(value))
    }
}

impl Error {
    /// Whether the update processor should keep retrying after this error.
    ///
    /// Transport errors are always worth retrying. HTTP statuses are
    /// classified by [`is_http_error_recoverable`].
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Unauthorized => false,
            Error::UnexpectedStatus(status) => is_http_error_recoverable(*status),
            Error::InvalidBaseUri(_) | Error::InvalidStreamUri(_) | Error::EmptySdkKey => false,
            Error::Network(err) => {
                // A status captured inside a reqwest error follows the same
                // table; pure transport failures are retried.
                match err.status() {
                    Some(status) => is_http_error_recoverable(status),
                    None => true,
                }
            }
            Error::Io(_) => true,
            // Bad event payloads don't invalidate the connection.
            Error::InvalidEventData(_) | Error::UnknownDataPath(_) => true,
            Error::ProcessorPanicked | Error::ClosedBeforeInitialization => false,
        }
    }
}

/// Classify an HTTP status as recoverable (retry) or not (shut down).
///
/// 4xx responses mean the request itself is bad and retrying cannot help,
/// except for 408 (request timeout) and 429 (rate limited). Everything
/// else, including all 5xx, is worth retrying.
pub(crate) fn is_http_error_recoverable(status: StatusCode) -> bool {
    if !status.is_client_error() {
        return true;
    }
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
    )
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::is_http_error_recoverable;

    #[test]
    fn client_errors_are_terminal() {
        assert!(!is_http_error_recoverable(StatusCode::UNAUTHORIZED));
        assert!(!is_http_error_recoverable(StatusCode::FORBIDDEN));
        assert!(!is_http_error_recoverable(StatusCode::NOT_FOUND));
        assert!(!is_http_error_recoverable(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn timeout_and_rate_limit_are_retried() {
        assert!(is_http_error_recoverable(StatusCode::REQUEST_TIMEOUT));
        assert!(is_http_error_recoverable(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn server_errors_are_retried() {
        assert!(is_http_error_recoverable(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_http_error_recoverable(StatusCode::BAD_GATEWAY));
        assert!(is_http_error_recoverable(StatusCode::SERVICE_UNAVAILABLE));
    }
}
