//! Discovery API client: lists the tunnel endpoints this agent should open.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::backoff::{Backoff, RetryConfig};

/// Per-request timeout on the discovery API.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Discovery client errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid discovery base url {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed with code {status}: {message}")]
    Api { status: u16, message: String },
}

impl DiscoveryError {
    /// Connection-level failures and server errors are worth another try;
    /// anything else is final.
    fn is_retryable(&self) -> bool {
        match self {
            DiscoveryError::Request(err) => err.is_connect() || err.is_timeout(),
            DiscoveryError::Api { status, .. } => *status >= 500,
            DiscoveryError::InvalidBaseUrl { .. } => false,
        }
    }
}

/// One tunnel the agent should open, as reported by the discovery API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelEndpoint {
    /// Opaque id, unique per logical tunnel within one discovery response.
    pub tunnel_id: String,
    /// URL of the broker's WebSocket listener; the tunnel id is appended as
    /// a path segment when dialing.
    pub broker_endpoint: String,
    /// host:port whose port selects the local gateway port. The host part is
    /// operator-supplied configuration, not this field.
    pub cluster_endpoint: String,
}

/// Backend able to list the tunnels the agent needs to open.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync + 'static {
    async fn list_tunnel_endpoints(&self) -> Result<Vec<TunnelEndpoint>, DiscoveryError>;
}

#[async_trait]
impl<B: DiscoveryBackend + ?Sized> DiscoveryBackend for std::sync::Arc<B> {
    async fn list_tunnel_endpoints(&self) -> Result<Vec<TunnelEndpoint>, DiscoveryError> {
        (**self).list_tunnel_endpoints().await
    }
}

/// HTTP client for the broker discovery API.
pub struct DiscoveryClient {
    base_url: Url,
    token: String,
    http: reqwest::Client,
    retry: RetryConfig,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: String,
}

impl DiscoveryClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, DiscoveryError> {
        let parsed = Url::parse(base_url).map_err(|err| DiscoveryError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: err.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(DiscoveryError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: "not a hierarchical url".to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: parsed,
            token: token.into(),
            http,
            retry: RetryConfig::default(),
        })
    }

    /// Overrides the default retry schedule.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint_url(&self) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("tunnel-endpoints");
        }
        url
    }

    async fn fetch(&self, url: &Url) -> Result<Vec<TunnelEndpoint>, DiscoveryError> {
        let response = self
            .http
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|body| body.error)
                .unwrap_or(body);
            return Err(DiscoveryError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl DiscoveryBackend for DiscoveryClient {
    async fn list_tunnel_endpoints(&self) -> Result<Vec<TunnelEndpoint>, DiscoveryError> {
        let url = self.endpoint_url();
        let mut backoff = Backoff::new(self.retry.clone());

        loop {
            match self.fetch(&url).await {
                Ok(endpoints) => {
                    debug!(count = endpoints.len(), "listed tunnel endpoints");
                    return Ok(endpoints);
                }
                Err(err) if err.is_retryable() => {
                    debug!(error = %err, "discovery attempt failed");
                    if !backoff.wait().await {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}
