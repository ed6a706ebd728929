// =============================================================================
// HTTP collaborator — plain GET with query parameters and a timeout
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::FeedError;

/// Status and raw body of one HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound request/response client used for historical backfills.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResponse, FeedError>;
}

/// [`HttpClient`] backed by a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("candle-feed/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FeedError::Network(format!("failed to build HTTP client: {e}")))?;

        debug!("ReqwestHttpClient initialised");
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[instrument(skip(self, query), name = "http::get")]
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResponse, FeedError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FeedError::Network(format!("GET {url} failed: {e}")))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| FeedError::Network(format!("failed to read body from {url}: {e}")))?;

        debug!(status, bytes = body.len(), "response received");
        Ok(HttpResponse { status, body })
    }
}

impl std::fmt::Debug for ReqwestHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestHttpClient").finish()
    }
}
