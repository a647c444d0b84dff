//! Harvester Core Library
//!
//! Resumable, concurrent pagination over the bioRxiv/medRxiv details
//! endpoint. Pages are fetched with bounded parallelism and retry, persisted
//! one checkpoint per page, then filtered and deduplicated into a final
//! record set.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Harvest configuration and validation
//! - [`record`] - Record model, DOI and affiliation normalization
//! - [`fetch`] - Page requests, strict decoding, retry with backoff
//! - [`checkpoint`] - Per-page durable store and resume inspection
//! - [`scheduler`] - Bounded worker pool with pagination discovery
//! - [`aggregate`] - Affiliation filter and version-aware deduplication
//! - [`harvest`] - Orchestration of one run across servers

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregate;
pub mod checkpoint;
pub mod config;
pub mod fetch;
pub mod harvest;
pub mod record;
pub mod scheduler;
mod user_agent;

// Re-export commonly used types
pub use aggregate::{AffiliationFilter, FinalRecordSet, aggregate};
pub use checkpoint::{CheckpointError, CheckpointStore, QuerySignature, ResumeState, scan};
pub use config::{ConfigError, HarvestConfig, Server, ServerSelection};
pub use fetch::{
    CatalogClient, DEFAULT_MAX_RETRIES, FetchError, FetchErrorKind, PageFetcher, PageRequest,
    PageResult, PageSource, RequestError, RetryPolicy,
};
pub use harvest::{HarvestError, HarvestOutput, Harvester, RunPhase, ServerRecords};
pub use record::RawRecord;
pub use scheduler::{FetchProgress, FetchScheduler, FetchSummary, NoProgress, ProgressSink};
