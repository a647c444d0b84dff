//! Retry logic with exponential backoff for transient page failures.
//!
//! When a request fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - timeouts, connection failures, HTTP 421 and 500
//! - [`FailureType::Fatal`] - every other HTTP status and any undecodable body
//!
//! The [`RetryPolicy`] then decides whether to retry based on failure type
//! and attempt count. Given the same sequence of failures it always makes
//! the same decisions; only the delay carries optional random jitter.
//!
//! # Example
//!
//! ```
//! use harvester_core::fetch::{RequestError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = RequestError::http_status("https://api.biorxiv.org/details/biorxiv", 500);
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::RequestError;

/// Default attempt budget per page.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// May succeed on retry.
    Transient,

    /// Will not succeed regardless of retries.
    Fatal,
}

/// Decision on whether to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 10
/// - `base_delay`: 1 second
/// - `max_delay`: 32 seconds
/// - `backoff_multiplier`: 2.0
/// - jitter: up to 500ms
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt (typically 2.0 for doubling).
    backoff_multiplier: f32,

    /// Upper bound of the random jitter; zero disables it.
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including initial (clamped to >= 1)
    /// * `base_delay` - Base delay for first retry
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Multiplier for exponential increase
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            max_jitter: MAX_JITTER,
        }
    }

    /// Creates a policy with a custom max_attempts, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Replaces the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Disables jitter so delays are fully deterministic.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.max_jitter = Duration::ZERO;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry a failed request.
    ///
    /// `attempt` is the attempt number that just failed (1-indexed).
    #[instrument(level = "trace", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Fatal {
            return RetryDecision::DoNotRetry {
                reason: "fatal failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Formula: `min(base_delay * multiplier^(attempt - 1), max_delay) + jitter`
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        // attempt 1 = 2^0 = 1x base
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        let jitter_ms = rng.gen_range(0..=self.max_jitter.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}

/// Classifies a request error into a failure type for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | Timeout | Transient |
/// | Network | Transient |
/// | HTTP 421 | Transient |
/// | HTTP 500 | Transient |
/// | Other HTTP status | Fatal |
/// | Decode / Malformed | Fatal |
/// | InvalidUrl | Fatal |
#[must_use]
pub fn classify_error(error: &RequestError) -> FailureType {
    match error {
        RequestError::HttpStatus { status, .. } => classify_http_status(*status),
        RequestError::Timeout { .. } | RequestError::Network { .. } => FailureType::Transient,
        RequestError::Decode { .. }
        | RequestError::Malformed { .. }
        | RequestError::InvalidUrl { .. } => FailureType::Fatal,
    }
}

fn classify_http_status(status: u16) -> FailureType {
    match status {
        // Misdirected Request, Internal Server Error
        421 | 500 => FailureType::Transient,
        _ => FailureType::Fatal,
    }
}
