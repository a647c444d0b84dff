//! HTTP client for the details endpoint.
//!
//! [`CatalogClient`] is built once per run and shared by every page worker,
//! taking advantage of connection pooling. It performs exactly one request
//! per call; retrying is the [`PageFetcher`](super::PageFetcher)'s job.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use super::page::{PageRequest, PageResult};
use super::RequestError;
use crate::user_agent;

/// Anything able to serve one page per call.
///
/// Implemented by [`CatalogClient`] for the real API. Tests substitute
/// scripted sources to replay exact failure sequences.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Performs a single attempt at fetching `request`.
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResult, RequestError>;
}

/// reqwest-backed client for `{base}/details/{server}/{start}/{end}/{cursor}`.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    client: Client,
    base_url: Url,
}

impl CatalogClient {
    /// Creates a client for `base_url` with the given per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the TLS backend cannot be initialised.
    #[instrument(level = "debug", fields(base_url = %base_url))]
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(user_agent::default_user_agent())
            .timeout(timeout)
            .gzip(true)
            .build()?;
        Ok(Self { client, base_url })
    }

    /// URL of the page described by `request`.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidUrl`] if the base URL cannot carry a path.
    pub fn page_url(&self, request: &PageRequest) -> Result<Url, RequestError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| RequestError::invalid_url(self.base_url.as_str()))?
            .pop_if_empty()
            .extend([
                "details".to_string(),
                request.server.as_str().to_string(),
                request.start_date.to_string(),
                request.end_date.to_string(),
                request.cursor().to_string(),
            ]);
        Ok(url)
    }
}

#[async_trait]
impl PageSource for CatalogClient {
    #[instrument(skip(self, request), fields(server = %request.server, page = request.page_index))]
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResult, RequestError> {
        let url = self.page_url(request)?;
        debug!(url = %url, "requesting page");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| RequestError::network(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RequestError::http_status(url.as_str(), status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RequestError::network(url.as_str(), e))?;

        PageResult::decode(request, url.as_str(), &body)
    }
}
