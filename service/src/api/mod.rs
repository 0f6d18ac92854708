//! Inbound HTTP and channel surface.

use axum::{
    extract::Request,
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use governor::middleware::NoOpMiddleware;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::App;

mod http;
mod ws;

pub struct Api {
    app: Arc<App>,
}

type IpGovernorConfig =
    tower_governor::governor::GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>;

impl Api {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                header::HeaderName::from_static("x-request-id"),
            ]);

        let router = Router::new()
            .route("/health", get(http::health))
            .route("/status", get(http::status))
            .route("/metrics/prometheus", get(http::prometheus_metrics))
            .route("/api/v1/kills/system/:system_id", get(http::kills_for_system))
            .route("/api/v1/kills/systems", post(http::kills_for_systems))
            .route("/api/v1/kills/cached/:system_id", get(http::cached_kills))
            .route("/api/v1/killmail/:id", get(http::killmail_by_id))
            .route("/api/v1/kills/count/:system_id", get(http::kill_count))
            .route(
                "/api/v1/subscriptions",
                post(http::create_subscription).get(http::list_subscriptions),
            )
            .route(
                "/api/v1/subscriptions/:subscriber_id",
                axum::routing::delete(http::delete_subscription),
            )
            .route("/socket", get(ws::socket))
            .route("/websocket", get(http::websocket_info));

        let router = match rate_limit_config() {
            Some(config) => router.layer(GovernorLayer { config }),
            None => router,
        };

        router
            .layer(cors)
            .layer(middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
            .with_state(self.app.clone())
    }
}

/// Optional per-IP rate limiting, entirely env-driven; off by default.
fn rate_limit_config() -> Option<Arc<IpGovernorConfig>> {
    let per_second: u64 = std::env::var("RATE_LIMIT_HTTP_PER_SEC")
        .ok()
        .and_then(|raw| raw.parse().ok())?;
    let burst: u32 = std::env::var("RATE_LIMIT_HTTP_BURST")
        .ok()
        .and_then(|raw| raw.parse().ok())?;
    if per_second == 0 || burst == 0 {
        return None;
    }
    let nanos_per_request = (1_000_000_000u64 / per_second).max(1);
    GovernorConfigBuilder::default()
        .period(Duration::from_nanos(nanos_per_request))
        .burst_size(burst)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .map(Arc::new)
}

async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(header::HeaderName::from_static("x-request-id"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(header::HeaderName::from_static("x-request-id"), header_value);
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}
