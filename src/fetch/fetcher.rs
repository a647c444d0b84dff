//! Page fetch with retry and exponential backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, instrument, warn};

use super::client::PageSource;
use super::page::{PageRequest, PageResult};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use super::FetchError;

/// Fetches pages from a [`PageSource`], retrying transient failures.
///
/// Side effects are limited to network I/O and backoff sleeps; persisting a
/// fetched page is the caller's responsibility.
pub struct PageFetcher {
    source: Arc<dyn PageSource>,
    policy: RetryPolicy,
    retried: AtomicU64,
}

impl std::fmt::Debug for PageFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFetcher")
            .field("policy", &self.policy)
            .field("retried", &self.retried())
            .finish_non_exhaustive()
    }
}

impl PageFetcher {
    /// Creates a fetcher over `source` using `policy`.
    #[must_use]
    pub fn new(source: Arc<dyn PageSource>, policy: RetryPolicy) -> Self {
        Self {
            source,
            policy,
            retried: AtomicU64::new(0),
        }
    }

    /// Returns the configured retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Number of retry attempts made so far across all pages.
    #[must_use]
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::SeqCst)
    }

    /// Fetches one page.
    ///
    /// Transient failures are retried until the policy's attempt budget is
    /// spent; fatal ones end the fetch immediately.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Exhausted`] carrying the last error when every
    /// attempt failed transiently, or [`FetchError::Fatal`] on the first
    /// non-retryable failure.
    #[instrument(skip(self, request), fields(server = %request.server, page = request.page_index))]
    pub async fn fetch(&self, request: &PageRequest) -> Result<PageResult, FetchError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(attempt, "attempting page fetch");

            let error = match self.source.fetch_page(request).await {
                Ok(page) => {
                    debug!(
                        attempt,
                        records = page.records.len(),
                        terminal = page.is_terminal,
                        "page fetched"
                    );
                    return Ok(page);
                }
                Err(error) => error,
            };

            let failure_type = classify_error(&error);
            match self.policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next_attempt,
                } => {
                    info!(
                        page = request.page_index,
                        attempt = next_attempt,
                        max_attempts = self.policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying page"
                    );
                    self.retried.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(
                        page = request.page_index,
                        attempt,
                        %reason,
                        error = %error,
                        "giving up on page"
                    );
                    return Err(match failure_type {
                        FailureType::Transient => FetchError::Exhausted {
                            page_index: request.page_index,
                            attempts: attempt,
                            last: error,
                        },
                        FailureType::Fatal => FetchError::Fatal {
                            page_index: request.page_index,
                            source: error,
                        },
                    });
                }
            }
        }
    }
}
