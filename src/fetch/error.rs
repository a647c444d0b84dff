//! Error types for the fetch module.
//!
//! [`RequestError`] describes one failed request. [`FetchError`] is what a
//! page fetch surfaces once retrying is over: either the attempt budget ran
//! out on transient failures, or a non-retryable failure ended it at once.

use std::fmt;

use thiserror::Error;

/// A single failed request against the details endpoint.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Connection-level failure (DNS, refused, reset, TLS).
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The page URL.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Request or body read timed out.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The page URL.
        url: String,
    },

    /// Non-success HTTP status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The page URL.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Body is not valid JSON or does not fit the response schema.
    #[error("invalid response body from {url}: {source}")]
    Decode {
        /// The page URL.
        url: String,
        /// The decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// Body decoded but contradicts the request (cursor echo, counts).
    #[error("malformed response from {url}: {reason}")]
    Malformed {
        /// The page URL.
        url: String,
        /// What was inconsistent.
        reason: String,
    },

    /// Page URL could not be built from the configured base.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending base URL.
        url: String,
    },
}

impl RequestError {
    /// Creates a network error, promoting client timeouts to [`RequestError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a decode error.
    pub fn decode(url: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            url: url.into(),
            source,
        }
    }

    /// Creates a malformed-response error.
    pub fn malformed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }
}

/// Class of a surfaced page failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Every attempt failed transiently.
    Exhausted,
    /// A non-retryable failure stopped the page immediately.
    Fatal,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => f.write_str("retries exhausted"),
            Self::Fatal => f.write_str("non-retryable error"),
        }
    }
}

/// A page that could not be fetched. Fatal to the whole run.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transient failures used up the attempt budget.
    #[error("page {page_index} failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Index of the failing page.
        page_index: u64,
        /// Attempts made.
        attempts: u32,
        /// The last underlying error.
        #[source]
        last: RequestError,
    },

    /// Non-retryable failure.
    #[error("page {page_index} failed: {source}")]
    Fatal {
        /// Index of the failing page.
        page_index: u64,
        /// The underlying error.
        #[source]
        source: RequestError,
    },
}

impl FetchError {
    /// Class of this failure.
    #[must_use]
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Exhausted { .. } => FetchErrorKind::Exhausted,
            Self::Fatal { .. } => FetchErrorKind::Fatal,
        }
    }

    /// Index of the page that failed.
    #[must_use]
    pub fn page_index(&self) -> u64 {
        match self {
            Self::Exhausted { page_index, .. } | Self::Fatal { page_index, .. } => *page_index,
        }
    }

    /// The request error that ended the fetch.
    #[must_use]
    pub fn request_error(&self) -> &RequestError {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Fatal { source, .. } => source,
        }
    }
}
