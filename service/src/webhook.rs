//! Webhook delivery and in-memory persistence of webhook subscriptions.
//!
//! Delivery is an HTTP POST of the killmail envelope to the subscriber's
//! callback. 2xx settles the attempt; 5xx, 408/425/429 and transport errors
//! retry with exponential backoff inside a bounded budget so a dead callback
//! can never accumulate work; any other 4xx is a permanent failure.

use crate::config::WebhookConfig;
use crate::error::{Error, Result};
use crate::metrics::{inc, Metrics};
use chrono::Utc;
use dashmap::DashMap;
use killfeed_types::{Killmail, SubscriptionView, SystemId, WebhookPayload};
use std::sync::Arc;

pub struct WebhookDispatcher {
    http: reqwest::Client,
    config: WebhookConfig,
    subscriptions: DashMap<String, SubscriptionView>,
    metrics: Arc<Metrics>,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            config,
            subscriptions: DashMap::new(),
            metrics,
        })
    }

    /// Remember the subscription config, keyed by subscriber. A subscriber
    /// re-POSTing replaces its previous config.
    pub fn persist(&self, view: SubscriptionView) {
        self.subscriptions.insert(view.subscriber_id.clone(), view);
    }

    pub fn get(&self, subscriber_id: &str) -> Option<SubscriptionView> {
        self.subscriptions
            .get(subscriber_id)
            .map(|view| view.value().clone())
    }

    pub fn remove(&self, subscriber_id: &str) -> Option<SubscriptionView> {
        self.subscriptions.remove(subscriber_id).map(|(_, view)| view)
    }

    pub fn list(&self) -> Vec<SubscriptionView> {
        self.subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// POST one batch of kills for one system to a callback.
    pub async fn deliver(
        &self,
        callback_url: &str,
        system_id: SystemId,
        kills: Vec<Killmail>,
    ) -> Result<()> {
        let payload = WebhookPayload {
            kind: WebhookPayload::KIND_KILLMAIL_UPDATE.into(),
            system_id,
            timestamp: Utc::now(),
            kills,
        };

        let mut backoff = self.config.backoff_base;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let last = attempt >= self.config.max_attempts;
            match self.http.post(callback_url).json(&payload).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        inc(&self.metrics.delivery.webhook_delivered);
                        return Ok(());
                    }
                    let transient = status.is_server_error()
                        || matches!(status.as_u16(), 408 | 425 | 429);
                    if !transient {
                        inc(&self.metrics.delivery.webhook_failed);
                        tracing::warn!(%callback_url, %status, "webhook rejected, not retrying");
                        return Err(Error::Validation(format!(
                            "callback returned {status}"
                        )));
                    }
                    if last {
                        inc(&self.metrics.delivery.webhook_failed);
                        return Err(response.error_for_status().unwrap_err().into());
                    }
                    tracing::debug!(%callback_url, %status, attempt, "webhook retrying");
                }
                Err(err) => {
                    if last {
                        inc(&self.metrics.delivery.webhook_failed);
                        return Err(err.into());
                    }
                    tracing::debug!(%callback_url, %err, attempt, "webhook transport error, retrying");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State as AxumState;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn dispatcher(metrics: Arc<Metrics>) -> WebhookDispatcher {
        WebhookDispatcher::new(
            WebhookConfig {
                timeout: Duration::from_secs(5),
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
            },
            metrics,
        )
        .unwrap()
    }

    fn kill() -> Killmail {
        Killmail {
            id: 1001,
            kill_time: Utc::now(),
            system_id: 30000142,
            victim: killfeed_types::Victim {
                ship_type_id: 587,
                damage_taken: 1,
                ..Default::default()
            },
            attackers: vec![],
            zkb: None,
            enrichment_complete: true,
        }
    }

    #[derive(Default)]
    struct Callback {
        posts: AtomicUsize,
        fail_first: usize,
        status_on_fail: u16,
        last_body: Mutex<Option<serde_json::Value>>,
    }

    async fn spawn_callback(state: Arc<Callback>) -> (String, tokio::task::JoinHandle<()>) {
        let router = Router::new()
            .route(
                "/hook",
                post(
                    |AxumState(state): AxumState<Arc<Callback>>,
                     Json(body): Json<serde_json::Value>| async move {
                        let attempt = state.posts.fetch_add(1, Ordering::SeqCst);
                        *state.last_body.lock().unwrap() = Some(body);
                        if attempt < state.fail_first {
                            StatusCode::from_u16(state.status_on_fail).unwrap().into_response()
                        } else {
                            StatusCode::OK.into_response()
                        }
                    },
                ),
            )
            .with_state(state);
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service()).await.unwrap();
        });
        (format!("http://{addr}/hook"), handle)
    }

    #[tokio::test]
    async fn delivers_envelope_with_retries_on_5xx() {
        let callback = Arc::new(Callback {
            fail_first: 2,
            status_on_fail: 500,
            ..Default::default()
        });
        let (url, handle) = spawn_callback(callback.clone()).await;
        let metrics = Arc::new(Metrics::new());
        let dispatcher = dispatcher(metrics.clone());

        dispatcher.deliver(&url, 30000142, vec![kill()]).await.unwrap();

        assert_eq!(callback.posts.load(Ordering::SeqCst), 3);
        let body = callback.last_body.lock().unwrap().clone().unwrap();
        assert_eq!(body["type"], "killmail_update");
        assert_eq!(body["system_id"], 30000142);
        assert_eq!(body["kills"][0]["id"], 1001);
        assert_eq!(metrics.snapshot().delivery.webhook_delivered, 1);
        handle.abort();
    }

    #[tokio::test]
    async fn permanent_4xx_is_not_retried() {
        let callback = Arc::new(Callback {
            fail_first: 10,
            status_on_fail: 410,
            ..Default::default()
        });
        let (url, handle) = spawn_callback(callback.clone()).await;
        let metrics = Arc::new(Metrics::new());
        let dispatcher = dispatcher(metrics.clone());

        let err = dispatcher.deliver(&url, 1, vec![kill()]).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(callback.posts.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.snapshot().delivery.webhook_failed, 1);
        handle.abort();
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let callback = Arc::new(Callback {
            fail_first: 10,
            status_on_fail: 503,
            ..Default::default()
        });
        let (url, handle) = spawn_callback(callback.clone()).await;
        let metrics = Arc::new(Metrics::new());
        let dispatcher = dispatcher(metrics.clone());

        assert!(dispatcher.deliver(&url, 1, vec![kill()]).await.is_err());
        assert_eq!(callback.posts.load(Ordering::SeqCst), 3);
        handle.abort();
    }

    #[test]
    fn persistence_is_keyed_by_subscriber() {
        let dispatcher = dispatcher(Arc::new(Metrics::new()));
        let view = SubscriptionView {
            id: "sub-1".into(),
            subscriber_id: "alice".into(),
            system_ids: vec![30000142],
            character_ids: vec![],
            callback_url: Some("http://example.invalid/hook".into()),
            created_at: Utc::now(),
        };
        dispatcher.persist(view.clone());
        assert_eq!(dispatcher.get("alice").unwrap().id, "sub-1");
        assert_eq!(dispatcher.list().len(), 1);

        // Re-POST replaces.
        let mut replacement = view;
        replacement.id = "sub-2".into();
        dispatcher.persist(replacement);
        assert_eq!(dispatcher.get("alice").unwrap().id, "sub-2");

        assert!(dispatcher.remove("alice").is_some());
        assert!(dispatcher.get("alice").is_none());
        assert!(dispatcher.is_empty());
    }
}
