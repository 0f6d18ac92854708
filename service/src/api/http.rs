//! REST handlers: thin read-throughs over the store and cache, webhook
//! subscription CRUD, health and status reports.

use crate::cache::Namespace;
use crate::error::Error;
use crate::metrics::render_prometheus;
use crate::subs::{SubscriptionSpec, Transport};
use crate::App;
use axum::extract::{Path, Query, State as AxumState};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration as ChronoDuration, Utc};
use killfeed_types::{
    ChannelInfo, ErrorBody, ErrorEnvelope, EventRecord, HealthResponse, KillCountResponse,
    Killmail, KillmailEnvelope, SubscriptionCreated, SubscriptionRequest, SystemId,
    SystemKillsRequest, CHANNEL_TOPIC,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub(super) struct KillsQuery {
    since_hours: Option<u32>,
    limit: Option<usize>,
}

const DEFAULT_SINCE_HOURS: u32 = 24;
const DEFAULT_LIMIT: usize = 200;

fn envelope(record: EventRecord) -> KillmailEnvelope {
    KillmailEnvelope {
        sequence: record.sequence,
        system_id: record.system_id,
        killmail: (*record.killmail).clone(),
    }
}

fn error_response(status: StatusCode, kind: &str, message: String) -> Response {
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: kind.to_string(),
            message,
            code: status.as_u16(),
            details: None,
        },
        timestamp: Utc::now(),
    };
    (status, Json(body)).into_response()
}

fn map_error(err: Error) -> Response {
    let status = match &err {
        Error::Validation(_) | Error::Killmail(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.kind(), err.to_string())
}

pub(super) async fn health(AxumState(app): AxumState<Arc<App>>) -> Response {
    let store_stats = app.store.stats();
    Json(HealthResponse {
        healthy: true,
        details: serde_json::json!({
            "uptime_secs": app.metrics.uptime_secs(),
            "events": store_stats.events,
            "subscriptions": app.registry.len(),
            "cache_entries": app.cache.len(),
        }),
    })
    .into_response()
}

pub(super) async fn status(AxumState(app): AxumState<Arc<App>>) -> Response {
    Json(serde_json::json!({
        "metrics": app.metrics.snapshot(),
        "system": app.system_metrics.snapshot(),
        "store": app.store.stats(),
        "cache": app.cache.stats(),
        "indexes": {
            "systems": app.registry.system_index().stats(),
            "characters": app.registry.character_index().stats(),
        },
        "subscriptions": {
            "workers": app.registry.len(),
            "webhooks": app.webhooks.len(),
        },
    }))
    .into_response()
}

pub(super) async fn prometheus_metrics(AxumState(app): AxumState<Arc<App>>) -> Response {
    let body = render_prometheus(&app.metrics.snapshot(), &app.system_metrics.snapshot());
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        body,
    )
        .into_response()
}

pub(super) async fn kills_for_system(
    AxumState(app): AxumState<Arc<App>>,
    Path(system_id): Path<SystemId>,
    Query(query): Query<KillsQuery>,
) -> Response {
    let since = Utc::now()
        - ChronoDuration::hours(i64::from(query.since_hours.unwrap_or(DEFAULT_SINCE_HOURS)));
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let kills: Vec<KillmailEnvelope> = app
        .store
        .recent_for_system(system_id, since, limit)
        .into_iter()
        .map(envelope)
        .collect();
    Json(kills).into_response()
}

pub(super) async fn kills_for_systems(
    AxumState(app): AxumState<Arc<App>>,
    Json(request): Json<SystemKillsRequest>,
) -> Response {
    let since = Utc::now() - ChronoDuration::hours(i64::from(request.since_hours));
    let mut by_system: HashMap<String, Vec<KillmailEnvelope>> = HashMap::new();
    for system_id in request.system_ids {
        let kills = app
            .store
            .recent_for_system(system_id, since, request.limit)
            .into_iter()
            .map(envelope)
            .collect();
        by_system.insert(system_id.to_string(), kills);
    }
    Json(by_system).into_response()
}

/// Cache-only view: events still present in the killmail cache, no fetch.
pub(super) async fn cached_kills(
    AxumState(app): AxumState<Arc<App>>,
    Path(system_id): Path<SystemId>,
) -> Response {
    let since = Utc::now() - ChronoDuration::hours(i64::from(DEFAULT_SINCE_HOURS));
    let kills: Vec<KillmailEnvelope> = app
        .store
        .recent_for_system(system_id, since, DEFAULT_LIMIT)
        .into_iter()
        .filter(|record| {
            app.cache
                .contains(Namespace::Killmails, &record.killmail.id.to_string())
        })
        .map(envelope)
        .collect();
    Json(kills).into_response()
}

pub(super) async fn killmail_by_id(
    AxumState(app): AxumState<Arc<App>>,
    Path(id): Path<u64>,
) -> Response {
    match app
        .cache
        .get::<Killmail>(Namespace::Killmails, &id.to_string())
        .into_option()
    {
        Some(killmail) => Json(killmail).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("killmail {id} is not cached"),
        ),
    }
}

pub(super) async fn kill_count(
    AxumState(app): AxumState<Arc<App>>,
    Path(system_id): Path<SystemId>,
) -> Response {
    Json(KillCountResponse {
        count: app.store.count_for_system(system_id),
    })
    .into_response()
}

pub(super) async fn create_subscription(
    AxumState(app): AxumState<Arc<App>>,
    Json(request): Json<SubscriptionRequest>,
) -> Response {
    if request.subscriber_id.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "subscriber_id must not be empty".into(),
        );
    }
    if url::Url::parse(&request.callback_url).is_err() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("invalid callback_url: {}", request.callback_url),
        );
    }

    // Re-POSTing under the same subscriber replaces the old subscription.
    if app.webhooks.get(&request.subscriber_id).is_some() {
        app.registry.stop_by_subscriber(&request.subscriber_id).await;
        app.webhooks.remove(&request.subscriber_id);
    }

    let spec = SubscriptionSpec {
        subscriber_id: request.subscriber_id.clone(),
        systems: request.system_ids.iter().copied().collect(),
        characters: request.character_ids.iter().copied().collect(),
        transport: Transport::Webhook {
            callback_url: request.callback_url.clone(),
        },
    };
    match app.registry.register(spec) {
        Ok(id) => {
            if let Some(view) = app.registry.view(&id) {
                app.webhooks.persist(view);
            }
            Json(SubscriptionCreated { id }).into_response()
        }
        Err(err) => map_error(err),
    }
}

pub(super) async fn list_subscriptions(AxumState(app): AxumState<Arc<App>>) -> Response {
    Json(app.webhooks.list()).into_response()
}

pub(super) async fn delete_subscription(
    AxumState(app): AxumState<Arc<App>>,
    Path(subscriber_id): Path<String>,
) -> Response {
    let removed = app.webhooks.remove(&subscriber_id);
    let stopped = app.registry.stop_by_subscriber(&subscriber_id).await;
    if removed.is_none() && stopped == 0 {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no subscription for {subscriber_id}"),
        );
    }
    StatusCode::NO_CONTENT.into_response()
}

pub(super) async fn websocket_info(AxumState(app): AxumState<Arc<App>>) -> Response {
    Json(ChannelInfo {
        path: "/socket".into(),
        topic: CHANNEL_TOPIC.into(),
        client_frames: vec![
            "join".into(),
            "subscribe_systems".into(),
            "unsubscribe_systems".into(),
            "subscribe_characters".into(),
            "unsubscribe_characters".into(),
        ],
        server_frames: vec![
            "ack".into(),
            "error".into(),
            "killmail_update".into(),
            "system_stats".into(),
        ],
        max_systems: app.config.subscription.max_systems,
        max_characters: app.config.subscription.max_characters,
    })
    .into_response()
}
