//! Bearer credential collaborator and best-effort token inspection.
//!
//! Token decoding here reads the unverified claims segment of a JWT. It is a
//! UX heuristic for skipping doomed connection attempts, never an
//! authorization decision.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;

/// Supplies the bearer token used for each connection attempt, and announces
/// every rotation.
///
/// `None` means no credential is available. A source that cannot be reached
/// should also answer `None`; the connection manager fails fast on it.
pub trait CredentialSource: Send + Sync + 'static {
    fn token(&self) -> Option<String>;

    /// Replace the current token. Subscribers are notified.
    fn rotate(&self, token: Option<String>);

    /// Receiver that changes on every rotation.
    fn subscribe(&self) -> watch::Receiver<Option<String>>;
}

/// In-memory credential holder backed by a watch channel.
#[derive(Debug)]
pub struct StaticCredentials {
    tx: watch::Sender<Option<String>>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>) -> Self {
        let (tx, _) = watch::channel(token);
        Self { tx }
    }

    pub fn set(&self, token: Option<String>) {
        self.tx.send_replace(token);
    }
}

impl Default for StaticCredentials {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CredentialSource for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    fn rotate(&self, token: Option<String>) {
        self.set(token);
    }

    fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

/// Credential validity as seen by the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Valid,
    Missing,
    Expired,
}

impl CredentialStatus {
    pub fn of(token: Option<&str>) -> Self {
        Self::of_at(token, Utc::now())
    }

    /// Opaque (non-JWT) tokens are passed through as valid; only a decodable
    /// `exp` in the past rejects a token before the server sees it.
    pub fn of_at(token: Option<&str>, now: DateTime<Utc>) -> Self {
        match token {
            None => Self::Missing,
            Some(t) if t.is_empty() => Self::Missing,
            Some(t) if expires_at(t).is_some_and(|exp| now >= exp) => Self::Expired,
            Some(_) => Self::Valid,
        }
    }
}

/// Decode the claims segment of a JWT-shaped token without verifying it.
pub fn decode_claims(token: &str) -> Option<Value> {
    let segment = token.split('.').nth(1)?;
    let trimmed = segment.trim_end_matches('=');
    let bytes = data_encoding::BASE64URL_NOPAD
        .decode(trimmed.as_bytes())
        .ok()?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        claims @ Value::Object(_) => Some(claims),
        _ => None,
    }
}

/// Whether the token's `exp` claim has passed.
///
/// Undecodable tokens count as expired. A token without `exp` never expires.
pub fn is_expired(token: &str) -> bool {
    is_expired_at(token, Utc::now())
}

pub fn is_expired_at(token: &str, now: DateTime<Utc>) -> bool {
    let Some(claims) = decode_claims(token) else {
        return true;
    };
    match claims.get("exp").and_then(Value::as_f64) {
        Some(exp) => now.timestamp() as f64 >= exp,
        None => false,
    }
}

/// Expiry instant from the `exp` claim, if any.
pub fn expires_at(token: &str) -> Option<DateTime<Utc>> {
    let exp = decode_claims(token)?.get("exp")?.as_f64()?;
    DateTime::from_timestamp(exp as i64, 0)
}

/// User id from the `sub`, `user_id` or `id` claim, first present wins.
pub fn extract_user_id(token: &str) -> Option<String> {
    let claims = decode_claims(token)?;
    ["sub", "user_id", "id"]
        .iter()
        .find_map(|name| match claims.get(*name)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

#[cfg(test)]
pub(crate) fn make_token(claims: &Value) -> String {
    let header = data_encoding::BASE64URL_NOPAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = data_encoding::BASE64URL_NOPAD.encode(claims.to_string().as_bytes());
    format!("{header}.{body}.sig")
}
