//! Page Fetcher: one page request against the details endpoint, with retry.
//!
//! # Features
//!
//! - Strict decoding of API responses into [`PageResult`]
//! - Terminal page detection (short page or declared total reached)
//! - Transient/fatal failure classification with exponential backoff
//! - A [`PageSource`] seam so the network client can be substituted
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use chrono::NaiveDate;
//! use harvester_core::config::Server;
//! use harvester_core::fetch::{CatalogClient, PageFetcher, PageQuery, RetryPolicy};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = CatalogClient::new("https://api.biorxiv.org".parse()?, Duration::from_secs(30))?;
//! let fetcher = PageFetcher::new(Arc::new(client), RetryPolicy::default());
//! let query = PageQuery {
//!     server: Server::Biorxiv,
//!     start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
//!     end_date: NaiveDate::from_ymd_opt(2024, 1, 7).unwrap(),
//!     page_size: 100,
//! };
//! let page = fetcher.fetch(&query.request(0)).await?;
//! println!("{} records, terminal: {}", page.records.len(), page.is_terminal);
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod fetcher;
mod page;
mod retry;

pub use client::{CatalogClient, PageSource};
pub use error::{FetchError, FetchErrorKind, RequestError};
pub use fetcher::PageFetcher;
pub use page::{PageQuery, PageRequest, PageResult};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};

#[cfg(test)]
pub(crate) use fetcher::tests as test_support;
