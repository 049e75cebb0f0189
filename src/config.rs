//! Environment-driven configuration.
//!
//! `APP_ENV=production` hardens defaults: a CORS allow-list becomes
//! mandatory and a missing `JWT_SECRET` is a startup error instead of a
//! warning (guests still work either way).

use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
    #[error("{0} is required in production")]
    MissingInProduction(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket listener.
    pub ws_addr: SocketAddr,
    /// HTTP read surface listener.
    pub http_addr: SocketAddr,
    /// CORS allow-list; empty means any origin (development only).
    pub client_origins: Vec<String>,
    /// Optional write-through cache.
    pub redis_url: Option<String>,
    /// HS256 verification key for access tokens.
    pub jwt_secret: Option<String>,
    pub production: bool,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Handshake must complete within this window.
    pub handshake_timeout: Duration,
    /// Disconnect grace for players.
    pub grace_period: Duration,
    /// Server-wide soft cap on spectators per room.
    pub spectator_cap: usize,
    /// Finished rooms linger this long before collection.
    pub finished_room_ttl: Duration,
    /// Waiting rooms without an opponent are reclaimed after this.
    pub waiting_room_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8081)),
            client_origins: Vec::new(),
            redis_url: None,
            jwt_secret: None,
            production: false,
            max_connections: 1000,
            handshake_timeout: Duration::from_secs(20),
            grace_period: Duration::from_secs(60),
            spectator_cap: 50,
            finished_room_ttl: Duration::from_secs(30 * 60),
            waiting_room_ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl Config {
    /// Read configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        config.production = env::var("APP_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        if let Ok(raw) = env::var("PORT") {
            let port: u16 = raw
                .parse()
                .map_err(|_| ConfigError::Invalid("PORT", raw.clone()))?;
            config.ws_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            config.http_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port.saturating_add(1)));
        }
        if let Ok(raw) = env::var("HTTP_PORT") {
            let port: u16 = raw
                .parse()
                .map_err(|_| ConfigError::Invalid("HTTP_PORT", raw.clone()))?;
            config.http_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        }

        if let Ok(raw) = env::var("CLIENT_URL") {
            config.client_origins = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        config.redis_url = env::var("REDIS_URL").ok().filter(|s| !s.is_empty());
        config.jwt_secret = env::var("JWT_SECRET").ok().filter(|s| !s.is_empty());

        if config.production {
            if config.client_origins.is_empty() {
                return Err(ConfigError::MissingInProduction("CLIENT_URL"));
            }
            if config.jwt_secret.is_none() {
                return Err(ConfigError::MissingInProduction("JWT_SECRET"));
            }
        }

        Ok(config)
    }

    pub fn grace_period_ms(&self) -> i64 {
        self.grace_period.as_millis() as i64
    }

    pub fn finished_room_ttl_ms(&self) -> i64 {
        self.finished_room_ttl.as_millis() as i64
    }

    pub fn waiting_room_ttl_ms(&self) -> i64 {
        self.waiting_room_ttl.as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_development_friendly() {
        let config = Config::default();
        assert_eq!(config.ws_addr.port(), 8080);
        assert_eq!(config.http_addr.port(), 8081);
        assert!(!config.production);
        assert_eq!(config.grace_period, Duration::from_secs(60));
        assert_eq!(config.handshake_timeout, Duration::from_secs(20));
    }

    #[test]
    fn millisecond_views_match_durations() {
        let config = Config::default();
        assert_eq!(config.grace_period_ms(), 60_000);
        assert_eq!(config.finished_room_ttl_ms(), 30 * 60_000);
        assert_eq!(config.waiting_room_ttl_ms(), 60 * 60_000);
    }
}
