//! Client for the upstream kill queue.
//!
//! The queue endpoint long-polls: the request blocks server-side for up to
//! ~10 seconds and answers either `{"package": {...}}` or `{"package": null}`.
//! Popping is the implicit ack, so a response lost on the wire costs at most
//! one message, which upstream does not replay. Pacing and failure backoff
//! belong to the poller, not this client.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

// Queue holds the request up to ~10s server-side; leave slack on top.
const POLL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct QueueResponse {
    package: Option<serde_json::Value>,
}

pub struct QueueClient {
    http: reqwest::Client,
    url: String,
}

impl QueueClient {
    pub fn new(url: &str) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(POLL_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }

    /// One long-poll. `None` means the queue was empty this round.
    pub async fn poll(&self) -> Result<Option<serde_json::Value>> {
        let response = self.http.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Validation(format!(
                "queue returned {status} for {}",
                self.url
            )));
        }
        let body: QueueResponse = response.json().await?;
        Ok(body.package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::net::SocketAddr;

    #[tokio::test]
    async fn poll_distinguishes_payload_from_empty() {
        let router = Router::new()
            .route(
                "/full",
                get(|| async { Json(serde_json::json!({"package": {"killID": 1}})) }),
            )
            .route(
                "/empty",
                get(|| async { Json(serde_json::json!({"package": null})) }),
            );
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service()).await.unwrap();
        });

        let full = QueueClient::new(&format!("http://{addr}/full")).unwrap();
        assert!(full.poll().await.unwrap().is_some());

        let empty = QueueClient::new(&format!("http://{addr}/empty")).unwrap();
        assert!(empty.poll().await.unwrap().is_none());

        handle.abort();
    }
}
