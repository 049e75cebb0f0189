//! Background sweeps.
//!
//! Two interval loops drive the time-based transitions the request path
//! cannot: flag-fall against a silent side on move, disconnect-grace
//! expiry, and idle-room garbage collection. The fast loop runs twice a
//! second so a flag-fall is detected within a second of true expiry.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::debug;

use crate::config::Config;
use crate::room::engine::Engine;
use crate::room::now_ms;

const FAST_SWEEP_PERIOD: Duration = Duration::from_millis(500);
const GC_PERIOD: Duration = Duration::from_secs(60);

/// Clock and grace sweep. Never returns; run it on its own task.
pub async fn run_fast_sweep(engine: Arc<Engine>) {
    let mut ticker = interval(FAST_SWEEP_PERIOD);
    loop {
        ticker.tick().await;
        let now = now_ms();
        engine.sweep_clocks(now).await;
        engine.sweep_grace(now).await;
    }
}

/// Idle-room garbage collection. Never returns; run it on its own task.
pub async fn run_gc(engine: Arc<Engine>, config: Config) {
    let mut ticker = interval(GC_PERIOD);
    loop {
        ticker.tick().await;
        let now = now_ms();
        debug!("running idle room collection");
        engine
            .sweep_idle_rooms(
                now,
                config.finished_room_ttl_ms(),
                config.waiting_room_ttl_ms(),
            )
            .await;
    }
}
