//! Identity Resolution
//!
//! Converts a transport-level connection into a stable participant identity.
//! Validates bearer tokens from an external auth provider; the server does
//! NOT issue tokens, it only verifies them. Invalid tokens are demoted to
//! the guest or connection path — a connection is never rejected on auth
//! grounds.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Transport handle for a single live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A stable participant identity.
///
/// `User` and `Guest` survive reconnection; `Connection` lives and dies with
/// its transport handle. Dispatch on the variant instead of null-checking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Identity {
    /// Verified user id from a signed access token.
    User(String),
    /// Client-persisted opaque guest id.
    Guest(String),
    /// Fallback: the connection handle itself.
    Connection(ConnectionId),
}

impl Identity {
    /// Whether this identity can be reclaimed after the connection drops.
    pub fn survives_reconnect(&self) -> bool {
        !matches!(self, Identity::Connection(_))
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Identity::User(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::User(id) => write!(f, "user:{id}"),
            Identity::Guest(id) => write!(f, "guest:{id}"),
            Identity::Connection(id) => write!(f, "conn:{id}"),
        }
    }
}

impl FromStr for Identity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("user:") {
            if rest.is_empty() {
                return Err(IdentityParseError);
            }
            Ok(Identity::User(rest.to_string()))
        } else if let Some(rest) = s.strip_prefix("guest:") {
            if rest.is_empty() {
                return Err(IdentityParseError);
            }
            Ok(Identity::Guest(rest.to_string()))
        } else if let Some(rest) = s.strip_prefix("conn:") {
            Ok(Identity::Connection(
                rest.parse().map_err(|_| IdentityParseError)?,
            ))
        } else {
            Err(IdentityParseError)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unrecognized identity encoding")]
pub struct IdentityParseError;

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Token verification configuration.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// HS256 verification key. When absent, all tokens are rejected and
    /// every participant resolves to a guest or connection identity.
    pub secret: Option<String>,
}

impl AuthConfig {
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }
}

/// Claims expected on an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the user id.
    pub sub: String,
    /// Expiry (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Token type; only `access` tokens grant identity.
    #[serde(default, rename = "type")]
    pub token_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token verification not configured")]
    NotConfigured,
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("not an access token")]
    WrongType,
    #[error("missing required claim: {0}")]
    MissingClaim(&'static str),
}

/// Validate an access token and extract its claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let secret = config.secret.as_ref().ok_or(AuthError::NotConfigured)?;

    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims = std::collections::HashSet::new();
    validation.validate_exp = false;

    let data = decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::Invalid,
    })?;

    let claims = data.claims;
    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub"));
    }
    match claims.token_type.as_deref() {
        Some("access") => {}
        _ => return Err(AuthError::WrongType),
    }
    if claims.exp > 0 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now > claims.exp {
            return Err(AuthError::Expired);
        }
    }

    Ok(claims)
}

/// Longest accepted client-supplied guest id.
pub const MAX_GUEST_ID_LEN: usize = 64;

/// Resolve a connection's handshake credentials into a stable identity.
///
/// Resolution order: verified token, then guest id, then the connection
/// handle. Failures demote to the next path instead of rejecting.
pub fn resolve(
    token: Option<&str>,
    guest_id: Option<&str>,
    connection: ConnectionId,
    config: &AuthConfig,
) -> Identity {
    if let Some(token) = token {
        match validate_token(token, config) {
            Ok(claims) => return Identity::User(claims.sub),
            Err(err) => {
                tracing::debug!("token rejected, demoting: {err}");
            }
        }
    }
    if let Some(guest) = guest_id {
        if !guest.is_empty() && guest.len() <= MAX_GUEST_ID_LEN {
            return Identity::Guest(guest.to_string());
        }
    }
    Identity::Connection(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn mint(claims: &TokenClaims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn access_claims(sub: &str) -> TokenClaims {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        TokenClaims {
            sub: sub.into(),
            exp: now + 3600,
            token_type: Some("access".into()),
        }
    }

    fn config() -> AuthConfig {
        AuthConfig {
            secret: Some("a-256-bit-test-secret-goes-here!".into()),
        }
    }

    #[test]
    fn valid_token_resolves_to_user() {
        let cfg = config();
        let token = mint(&access_claims("u-42"), cfg.secret.as_deref().unwrap());
        let id = resolve(Some(&token), None, ConnectionId::generate(), &cfg);
        assert_eq!(id, Identity::User("u-42".into()));
        assert!(id.is_authenticated());
    }

    #[test]
    fn expired_token_demotes_to_guest() {
        let cfg = config();
        let mut claims = access_claims("u-42");
        claims.exp = 1;
        let token = mint(&claims, cfg.secret.as_deref().unwrap());
        let id = resolve(Some(&token), Some("g-7"), ConnectionId::generate(), &cfg);
        assert_eq!(id, Identity::Guest("g-7".into()));
    }

    #[test]
    fn refresh_token_is_not_an_identity() {
        let cfg = config();
        let mut claims = access_claims("u-42");
        claims.token_type = Some("refresh".into());
        let token = mint(&claims, cfg.secret.as_deref().unwrap());
        let conn = ConnectionId::generate();
        let id = resolve(Some(&token), None, conn, &cfg);
        assert_eq!(id, Identity::Connection(conn));
    }

    #[test]
    fn bad_signature_demotes() {
        let cfg = config();
        let token = mint(&access_claims("u-42"), "another-secret-entirely!!!!!!!!!");
        let conn = ConnectionId::generate();
        let id = resolve(Some(&token), None, conn, &cfg);
        assert_eq!(id, Identity::Connection(conn));
    }

    #[test]
    fn oversized_guest_id_falls_through() {
        let cfg = AuthConfig::default();
        let long = "g".repeat(MAX_GUEST_ID_LEN + 1);
        let conn = ConnectionId::generate();
        assert_eq!(
            resolve(None, Some(&long), conn, &cfg),
            Identity::Connection(conn)
        );
    }

    #[test]
    fn identity_encoding_round_trips() {
        let samples = [
            Identity::User("u-1".into()),
            Identity::Guest("abc".into()),
            Identity::Connection(ConnectionId::generate()),
        ];
        for id in samples {
            let encoded = id.to_string();
            assert_eq!(encoded.parse::<Identity>().unwrap(), id);
        }
        assert!("nonsense".parse::<Identity>().is_err());
        assert!("user:".parse::<Identity>().is_err());
    }

    #[test]
    fn connection_identity_does_not_survive_reconnect() {
        assert!(Identity::User("u".into()).survives_reconnect());
        assert!(Identity::Guest("g".into()).survives_reconnect());
        assert!(!Identity::Connection(ConnectionId::generate()).survives_reconnect());
    }
}
