//! Shared HTTP plumbing for provider clients.

use std::time::Duration;

use danmu_core::{Error, Result};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::danmu::rate_limit::RateLimiter;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) danmu-sync/",
    env!("CARGO_PKG_VERSION")
);

/// A reqwest client paired with the provider's rate limiter.
///
/// Every request waits for the limiter, and remote rate limiting
/// (HTTP 412 or 429) is reported as [`Error::Throttled`].
pub(crate) struct ProviderHttp {
    provider: &'static str,
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl ProviderHttp {
    pub fn new(provider: &'static str, min_interval: Duration, headers: HeaderMap) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::http(provider, e))?;

        Ok(Self {
            provider,
            client,
            limiter: RateLimiter::new(min_interval),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn min_interval(&self) -> Duration {
        self.limiter.min_interval()
    }

    /// Send a request after waiting for the limiter.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        self.limiter.acquire().await;

        let response = request
            .send()
            .await
            .map_err(|e| Error::http(self.provider, e))?;
        let status = response.status();
        debug!(provider = self.provider, url = %response.url(), %status, "Provider response");

        if status == StatusCode::PRECONDITION_FAILED || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::throttled(self.provider));
        }
        if !status.is_success() {
            return Err(Error::http(
                self.provider,
                format!("{status} from {}", response.url()),
            ));
        }
        Ok(response)
    }

    pub async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let body = self.send(request).await?.bytes().await.map_err(|e| Error::http(self.provider, e))?;
        serde_json::from_slice(&body).map_err(|e| Error::parse(self.provider, e))
    }

    pub async fn text(&self, request: RequestBuilder) -> Result<String> {
        self.send(request)
            .await?
            .text()
            .await
            .map_err(|e| Error::http(self.provider, e))
    }
}
