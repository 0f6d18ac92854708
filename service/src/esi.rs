//! Client for the upstream metadata API.
//!
//! Resolves `/{type}/{id}` name lookups and `/killmails/{id}/{hash}` full
//! records. Every call carries a hard deadline and a retry budget: 5xx and
//! transport failures back off and retry, 429 honors `Retry-After`, 404 maps
//! to a typed `NotFound` so the enrichment layer can cache the absence, and
//! remaining 4xx are surfaced without retry.

use crate::config::EnrichmentConfig;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry policy for upstream calls.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            factor: 2,
        }
    }
}

impl From<&EnrichmentConfig> for RetryPolicy {
    fn from(config: &EnrichmentConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            initial_backoff: config.retry_base,
            max_backoff: Duration::from_secs(30),
            factor: config.retry_factor.max(1),
        }
    }
}

impl RetryPolicy {
    fn next_backoff(&self, current: Duration) -> Duration {
        (current * self.factor).min(self.max_backoff)
    }
}

#[derive(Deserialize)]
struct NamedEntity {
    name: String,
}

pub struct EsiClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl EsiClient {
    pub fn new(base_url: &str, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }

    pub async fn character_name(&self, id: u64) -> Result<String> {
        self.get_named(&format!("characters/{id}")).await
    }

    pub async fn corporation_name(&self, id: u64) -> Result<String> {
        self.get_named(&format!("corporations/{id}")).await
    }

    pub async fn alliance_name(&self, id: u64) -> Result<String> {
        self.get_named(&format!("alliances/{id}")).await
    }

    pub async fn ship_type_name(&self, id: u64) -> Result<String> {
        self.get_named(&format!("universe/types/{id}")).await
    }

    /// Full killmail record for a partial upstream reference.
    pub async fn killmail(&self, id: u64, hash: &str) -> Result<serde_json::Value> {
        self.get_json(&format!("killmails/{id}/{hash}")).await
    }

    async fn get_named(&self, path: &str) -> Result<String> {
        self.get_json::<NamedEntity>(path).await.map(|entity| entity.name)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let last = attempt >= self.retry.max_attempts;
            match self.http.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }
                    if status == reqwest::StatusCode::NOT_FOUND {
                        return Err(Error::NotFound(url));
                    }
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = retry_after(&response);
                        if last {
                            return Err(Error::RateLimited { retry_after });
                        }
                        let delay = retry_after.unwrap_or(backoff);
                        tracing::debug!(%url, ?delay, "upstream rate limited, waiting");
                        tokio::time::sleep(delay).await;
                        backoff = self.retry.next_backoff(backoff);
                        continue;
                    }
                    if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
                        if last {
                            return Err(response.error_for_status().unwrap_err().into());
                        }
                        tracing::debug!(%url, %status, attempt, "upstream error, retrying");
                    } else {
                        // Remaining 4xx are our fault; retrying cannot help.
                        return Err(Error::Validation(format!(
                            "upstream returned {status} for {url}"
                        )));
                    }
                }
                Err(err) => {
                    if last {
                        if err.is_timeout() {
                            return Err(Error::Timeout {
                                elapsed: REQUEST_TIMEOUT,
                            });
                        }
                        return Err(err.into());
                    }
                    tracing::debug!(%url, %err, attempt, "transport error, retrying");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = self.retry.next_backoff(backoff);
        }
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State as AxumState;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn serve_router(router: Router) -> (String, tokio::task::JoinHandle<()>) {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let actual_addr = listener.local_addr().unwrap();
        let base_url = format!("http://{actual_addr}");

        let handle = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service()).await.unwrap();
        });
        (base_url, handle)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            factor: 2,
        }
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let counter = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/characters/:id",
                get(|AxumState(counter): AxumState<Arc<AtomicUsize>>| async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        StatusCode::SERVICE_UNAVAILABLE.into_response()
                    } else {
                        Json(serde_json::json!({"name": "Pilot"})).into_response()
                    }
                }),
            )
            .with_state(counter.clone());

        let (base_url, handle) = serve_router(router).await;
        let client = EsiClient::new(&base_url, fast_retry()).unwrap();
        let name = client.character_name(500).await.unwrap();
        assert_eq!(name, "Pilot");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        handle.abort();
    }

    #[tokio::test]
    async fn not_found_is_typed_and_not_retried() {
        let counter = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/alliances/:id",
                get(|AxumState(counter): AxumState<Arc<AtomicUsize>>| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NOT_FOUND
                }),
            )
            .with_state(counter.clone());

        let (base_url, handle) = serve_router(router).await;
        let client = EsiClient::new(&base_url, fast_retry()).unwrap();
        let err = client.alliance_name(1).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let counter = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/corporations/:id",
                get(|AxumState(counter): AxumState<Arc<AtomicUsize>>| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::BAD_REQUEST
                }),
            )
            .with_state(counter.clone());

        let (base_url, handle) = serve_router(router).await;
        let client = EsiClient::new(&base_url, fast_retry()).unwrap();
        let err = client.corporation_name(1).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn rate_limit_waits_and_retries() {
        let counter = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/universe/types/:id",
                get(|AxumState(counter): AxumState<Arc<AtomicUsize>>| async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    if attempt == 0 {
                        (
                            StatusCode::TOO_MANY_REQUESTS,
                            [(axum::http::header::RETRY_AFTER, "0")],
                        )
                            .into_response()
                    } else {
                        Json(serde_json::json!({"name": "Rifter"})).into_response()
                    }
                }),
            )
            .with_state(counter.clone());

        let (base_url, handle) = serve_router(router).await;
        let client = EsiClient::new(&base_url, fast_retry()).unwrap();
        let name = client.ship_type_name(587).await.unwrap();
        assert_eq!(name, "Rifter");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        handle.abort();
    }
}
