//! HTTP read surface.
//!
//! Small axum router next to the WebSocket listener: health, counters, and
//! the public room catalog. Origins are restricted by the `CLIENT_URL`
//! allow-list and the API is rate limited per source address.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::room::catalog::{self, Listing, ListingFilters};
use crate::room::engine::Engine;
use crate::room::RoomId;

/// Fixed-window request counter per source address.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<IpAddr, (u32, Instant)>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count a request; `false` means over budget.
    pub async fn allow(&self, addr: IpAddr, now: Instant) -> bool {
        let mut windows = self.windows.lock().await;
        let entry = windows.entry(addr).or_insert((0, now));
        if now.duration_since(entry.1) >= self.window {
            *entry = (0, now);
        }
        entry.0 += 1;
        entry.0 <= self.max_requests
    }
}

struct HttpState {
    engine: Arc<Engine>,
    limiter: RateLimiter,
    started_at: Instant,
}

/// Build the router and serve it. Runs until the process exits.
pub async fn run(config: Config, engine: Arc<Engine>) -> std::io::Result<()> {
    let state = Arc::new(HttpState {
        engine,
        limiter: RateLimiter::new(100, Duration::from_secs(15 * 60)),
        started_at: Instant::now(),
    });

    let app = router(state, &config);
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!("http surface listening on {}", config.http_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

fn router(state: Arc<HttpState>, config: &Config) -> Router {
    let cors = if config.client_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .client_origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("discarding unparseable CORS origin: {origin}");
                    None
                }
            })
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/rooms/listings", get(room_listings))
        .route("/api/rooms/:room_id", get(room_snapshot))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(cors)
        .with_state(state)
}

async fn rate_limit(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if !state.limiter.allow(addr.ip(), Instant::now()).await {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }
    next.run(request).await
}

async fn health(State(state): State<Arc<HttpState>>) -> Json<serde_json::Value> {
    let store = state.engine.store();
    Json(json!({
        "status": "ok",
        "components": {
            "cache": {
                "backend": store.cache_name(),
                "healthy": store.cache_healthy().await,
            },
            "websocket": {
                "connections": state.engine.hub().connection_count().await,
            },
        },
    }))
}

async fn stats(State(state): State<Arc<HttpState>>) -> Json<serde_json::Value> {
    Json(json!({
        "rooms": state.engine.store().count().await,
        "sessions": state.engine.registry().count().await,
        "connections": state.engine.hub().connection_count().await,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

async fn room_listings(
    State(state): State<Arc<HttpState>>,
    Query(filters): Query<ListingFilters>,
) -> Json<Vec<Listing>> {
    Json(catalog::listings(state.engine.store(), &filters).await)
}

async fn room_snapshot(
    State(state): State<Arc<HttpState>>,
    Path(room_id): Path<String>,
) -> Response {
    let Some(room_id) = RoomId::parse(&room_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(handle) = state.engine.store().get(&room_id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let room = handle.read().await;
    if room.settings.is_private {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(Listing::from(&*room)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_enforces_window_budget() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        let start = Instant::now();

        assert!(limiter.allow(addr, start).await);
        assert!(limiter.allow(addr, start).await);
        assert!(limiter.allow(addr, start).await);
        assert!(!limiter.allow(addr, start).await);

        // A different source has its own budget.
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.allow(other, start).await);
    }

    #[tokio::test]
    async fn rate_limiter_resets_after_window() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        let start = Instant::now();

        assert!(limiter.allow(addr, start).await);
        assert!(!limiter.allow(addr, start).await);
        assert!(limiter.allow(addr, start + Duration::from_secs(61)).await);
    }
}
