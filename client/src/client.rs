//! Retrying HTTP client over the killfeed REST surface.

use crate::channel::Channel;
use crate::{Error, Result};
use killfeed_types::{
    HealthResponse, KillCountResponse, Killmail, KillmailEnvelope, SubscriptionCreated,
    SubscriptionRequest, SubscriptionView, SystemId,
};
use serde::Serialize;
use std::time::Duration;
use url::Url;

/// Retry policy for HTTP requests against the service.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// POSTs are only retried when this is set; they are not idempotent in
    /// general (subscription creation is, by subscriber_id, but that is the
    /// caller's judgement).
    pub retry_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
            retry_non_idempotent: false,
        }
    }
}

fn is_retryable(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

pub struct Client {
    http: reqwest::Client,
    pub base_url: Url,
    retry: RetryPolicy,
}

impl Client {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        match base_url.scheme() {
            "http" | "https" => {}
            other => return Err(Error::InvalidScheme(other.to_string())),
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let url = self.base_url.join("health")?;
        Ok(self.get_with_retry(url).await?.json().await?)
    }

    pub async fn kills_for_system(
        &self,
        system_id: SystemId,
        since_hours: u32,
        limit: usize,
    ) -> Result<Vec<KillmailEnvelope>> {
        let mut url = self
            .base_url
            .join(&format!("api/v1/kills/system/{system_id}"))?;
        url.query_pairs_mut()
            .append_pair("since_hours", &since_hours.to_string())
            .append_pair("limit", &limit.to_string());
        Ok(self.get_with_retry(url).await?.json().await?)
    }

    /// `None` when the service does not have the killmail cached.
    pub async fn killmail(&self, id: u64) -> Result<Option<Killmail>> {
        let url = self.base_url.join(&format!("api/v1/killmail/{id}"))?;
        let response = self.http.get(url.clone()).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(failed(response).await);
        }
        Ok(Some(response.json().await?))
    }

    pub async fn kill_count(&self, system_id: SystemId) -> Result<u64> {
        let url = self.base_url.join(&format!("api/v1/kills/count/{system_id}"))?;
        let body: KillCountResponse = self.get_with_retry(url).await?.json().await?;
        Ok(body.count)
    }

    pub async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionCreated> {
        let url = self.base_url.join("api/v1/subscriptions")?;
        Ok(self.post_json_with_retry(url, request).await?.json().await?)
    }

    pub async fn subscriptions(&self) -> Result<Vec<SubscriptionView>> {
        let url = self.base_url.join("api/v1/subscriptions")?;
        Ok(self.get_with_retry(url).await?.json().await?)
    }

    pub async fn delete_subscription(&self, subscriber_id: &str) -> Result<()> {
        let url = self
            .base_url
            .join(&format!("api/v1/subscriptions/{subscriber_id}"))?;
        let response = self.http.delete(url).send().await?;
        if !response.status().is_success() {
            return Err(failed(response).await);
        }
        Ok(())
    }

    /// Open the killmail channel on `/socket`.
    pub async fn connect_channel(&self) -> Result<Channel> {
        let mut ws_url = self.base_url.join("socket")?;
        let scheme = match ws_url.scheme() {
            "http" => "ws",
            _ => "wss",
        };
        ws_url
            .set_scheme(scheme)
            .map_err(|_| Error::InvalidScheme(ws_url.scheme().to_string()))?;
        Channel::connect(ws_url).await
    }

    pub async fn get_with_retry(&self, url: Url) -> Result<reqwest::Response> {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let last = attempt >= self.retry.max_attempts;
            match self.http.get(url.clone()).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if is_retryable(response.status()) && !last => {
                    tracing::debug!(%url, status = %response.status(), attempt, "retrying GET");
                }
                Ok(response) => return Err(failed(response).await),
                Err(err) if !last => {
                    tracing::debug!(%url, %err, attempt, "retrying GET after transport error");
                }
                Err(err) => return Err(err.into()),
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.retry.max_backoff);
        }
    }

    pub async fn post_json_with_retry<T: Serialize>(
        &self,
        url: Url,
        body: &T,
    ) -> Result<reqwest::Response> {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let last = attempt >= self.retry.max_attempts;
            match self.http.post(url.clone()).json(body).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response)
                    if is_retryable(response.status())
                        && self.retry.retry_non_idempotent
                        && !last =>
                {
                    tracing::debug!(%url, status = %response.status(), attempt, "retrying POST");
                }
                Ok(response) => return Err(failed(response).await),
                Err(err) if self.retry.retry_non_idempotent && !last => {
                    tracing::debug!(%url, %err, attempt, "retrying POST after transport error");
                }
                Err(err) => return Err(err.into()),
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.retry.max_backoff);
        }
    }
}

async fn failed(response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Error::FailedWithBody { status, body }
}
