//! Rookery Server
//!
//! Authoritative real-time chess room server: WebSocket event transport,
//! HTTP read surface, background sweeps.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rookery::cache::{NullCache, RedisCache, RoomCache};
use rookery::network::http;
use rookery::network::server::GameServer;
use rookery::room::engine::EngineLimits;
use rookery::{Config, Engine, Hub, RoomStore, SessionRegistry, VERSION};

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();

    info!("rookery v{VERSION}");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    if config.jwt_secret.is_none() {
        warn!("JWT_SECRET not set; all participants will be guests");
    }

    let cache: Arc<dyn RoomCache> = match config.redis_url.as_deref() {
        Some(url) => match RedisCache::connect(url).await {
            Ok(cache) => {
                info!("write-through cache connected");
                Arc::new(cache)
            }
            Err(e) => {
                warn!("cache unavailable, running in-memory only: {e}");
                Arc::new(NullCache)
            }
        },
        None => Arc::new(NullCache),
    };

    let store = Arc::new(RoomStore::new(cache));
    let registry = Arc::new(SessionRegistry::new());
    let hub = Arc::new(Hub::new());
    let limits = EngineLimits {
        spectator_cap: config.spectator_cap,
        grace_period_ms: config.grace_period_ms(),
    };
    let engine = Arc::new(Engine::new(store, registry, hub, limits));

    tokio::spawn(rookery::sweeper::run_fast_sweep(engine.clone()));
    tokio::spawn(rookery::sweeper::run_gc(engine.clone(), config.clone()));

    let http_config = config.clone();
    let http_engine = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = http::run(http_config, http_engine).await {
            error!("http surface error: {e}");
        }
    });

    let server = GameServer::new(config, engine);
    if let Err(e) = server.run().await {
        error!("server error: {e}");
    }
}
