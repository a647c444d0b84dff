//! Run configuration consumed by the harvest pipeline.
//!
//! [`HarvestConfig`] is a plain value: the binary builds it from command-line
//! arguments, tests build it directly. Nothing in the core reads environment
//! variables or files to obtain configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::fetch::{DEFAULT_MAX_RETRIES, RetryPolicy};

/// Public bioRxiv/medRxiv API endpoint (both servers share it).
pub const DEFAULT_API_BASE_URL: &str = "https://api.biorxiv.org";

/// Records per page served by the details endpoint.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Default number of pages fetched in parallel.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default sleep between polling cycles of the worker pool.
pub const DEFAULT_PAUSE: Duration = Duration::from_millis(200);

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default base delay for retry backoff.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 100;

/// Invalid configuration. Always fatal and reported before any network I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Start date is later than end date.
    #[error("invalid date range: start {start} is after end {end}")]
    InvalidDateRange {
        /// Requested start date.
        start: NaiveDate,
        /// Requested end date.
        end: NaiveDate,
    },

    /// Concurrency outside the accepted range.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The rejected value.
        value: usize,
    },

    /// Page size of zero.
    #[error("invalid page size {value}: must be greater than zero")]
    InvalidPageSize {
        /// The rejected value.
        value: u32,
    },

    /// Target affiliation given but blank.
    #[error("target affiliation is empty after trimming whitespace")]
    EmptyAffiliation,

    /// API base URL does not parse or is not http(s).
    #[error("invalid API base URL {url}: {reason}")]
    InvalidBaseUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Server name not recognised.
    #[error("unknown server '{value}': expected one of biorxiv, medrxiv, both")]
    UnknownServer {
        /// The rejected name.
        value: String,
    },
}

/// One preprint server reachable through the details endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Server {
    /// bioRxiv.
    Biorxiv,
    /// medRxiv.
    Medrxiv,
}

impl Server {
    /// Path segment used by the API and in checkpoint names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Biorxiv => "biorxiv",
            Self::Medrxiv => "medrxiv",
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which servers a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerSelection {
    /// bioRxiv only.
    Biorxiv,
    /// medRxiv only.
    Medrxiv,
    /// bioRxiv then medRxiv.
    #[default]
    Both,
}

impl ServerSelection {
    /// Servers in the order they are harvested.
    #[must_use]
    pub fn servers(self) -> Vec<Server> {
        match self {
            Self::Biorxiv => vec![Server::Biorxiv],
            Self::Medrxiv => vec![Server::Medrxiv],
            Self::Both => vec![Server::Biorxiv, Server::Medrxiv],
        }
    }
}

impl FromStr for ServerSelection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "biorxiv" => Ok(Self::Biorxiv),
            "medrxiv" => Ok(Self::Medrxiv),
            "both" => Ok(Self::Both),
            _ => Err(ConfigError::UnknownServer {
                value: s.to_string(),
            }),
        }
    }
}

/// Configuration for one harvest invocation.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Servers to harvest.
    pub servers: ServerSelection,
    /// First day of the posting window (inclusive).
    pub start_date: NaiveDate,
    /// Last day of the posting window (inclusive).
    pub end_date: NaiveDate,
    /// Exact corresponding-institution match; `None` keeps every record.
    pub target_affiliation: Option<String>,
    /// Sleep between polling cycles of the worker pool.
    pub pause: Duration,
    /// Maximum pages in flight.
    pub concurrency: usize,
    /// Attempt budget per page (clamped to at least one).
    pub max_retries: u32,
    /// Persistent checkpoint directory; ephemeral when `None`.
    pub checkpoint_location: Option<PathBuf>,
    /// Records per page served by the API.
    pub page_size: u32,
    /// API root, e.g. `https://api.biorxiv.org`.
    pub api_base_url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// First backoff delay; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Add random jitter to backoff delays.
    pub retry_jitter: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            servers: ServerSelection::default(),
            start_date: default_start_date(),
            end_date: chrono::Local::now().date_naive(),
            target_affiliation: None,
            pause: DEFAULT_PAUSE,
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            checkpoint_location: None,
            page_size: DEFAULT_PAGE_SIZE,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_jitter: true,
        }
    }
}

impl HarvestConfig {
    /// Checks every value the pipeline relies on.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_date > self.end_date {
            return Err(ConfigError::InvalidDateRange {
                start: self.start_date,
                end: self.end_date,
            });
        }
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(ConfigError::InvalidConcurrency {
                value: self.concurrency,
            });
        }
        if self.page_size == 0 {
            return Err(ConfigError::InvalidPageSize {
                value: self.page_size,
            });
        }
        if let Some(target) = &self.target_affiliation
            && target.trim().is_empty()
        {
            return Err(ConfigError::EmptyAffiliation);
        }
        self.base_url()?;
        Ok(())
    }

    /// Parsed API root.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBaseUrl`] when the URL does not parse
    /// or uses a scheme other than http/https.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.api_base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.api_base_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.api_base_url.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        Ok(url)
    }

    /// Retry policy derived from `max_retries` and the backoff settings.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::with_max_attempts(self.max_retries)
            .with_base_delay(self.retry_base_delay);
        if self.retry_jitter {
            policy
        } else {
            policy.without_jitter()
        }
    }
}

fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2013, 1, 1).unwrap_or_default()
}
