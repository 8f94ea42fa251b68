//! # Idempotency Stores
//!
//! Backends that hold cached responses and per-fingerprint locks. The
//! middleware only talks to the [`IdempotencyStore`] trait, so the backend is
//! picked once at construction time and injected as `Arc<dyn IdempotencyStore>`.

pub mod memory;
pub mod redis_store;

pub use memory::{InMemoryStore, InMemoryStoreConfig};
pub use redis_store::{RedisStore, RedisStoreConfig};

use crate::core::error::IdempotencyResult;
use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// A response captured from the wrapped service.
///
/// Once stored it is never mutated; stores replace whole values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// HTTP status code
    pub status: u16,

    /// Response headers, every value of every name in order
    #[serde(with = "header_map_serde")]
    pub headers: HeaderMap,

    /// Raw response body
    #[serde(with = "body_serde")]
    pub body: Bytes,

    /// When the response was captured
    pub timestamp: DateTime<Utc>,
}

impl CachedResponse {
    /// Capture a response produced right now
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status: status.as_u16(),
            headers,
            body,
            timestamp: Utc::now(),
        }
    }

    /// Status code of the cached response, falling back to 500 for values
    /// that cannot be represented (only possible with hand-edited records)
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Encode into the opaque record stored by networked backends
    pub fn encode(&self) -> IdempotencyResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a record produced by [`CachedResponse::encode`]
    pub fn decode(data: &[u8]) -> IdempotencyResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Release half of a store lock
#[async_trait]
pub trait LockRelease: Send {
    /// Give up ownership of the key
    async fn release(self: Box<Self>);
}

/// Exclusive ownership of one fingerprint.
///
/// Call [`LockGuard::release`] when done. A guard that is dropped without
/// being released schedules the release on the current tokio runtime, so the
/// lock is freed on every exit path.
pub struct LockGuard {
    key: String,
    release: Option<Box<dyn LockRelease>>,
}

impl LockGuard {
    /// Wrap a backend specific release handle
    pub fn new(key: impl Into<String>, release: Box<dyn LockRelease>) -> Self {
        Self {
            key: key.into(),
            release: Some(release),
        }
    }

    /// Key this guard protects
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock for other waiters
    pub async fn release(mut self) {
        if let Some(release) = self.release.take() {
            release.release().await;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release.release().await;
                });
            }
            Err(_) => {
                warn!(key = %self.key, "No tokio runtime available to release idempotency lock");
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Storage capability required by the idempotency middleware
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Look up a cached response; expired entries are reported as `None`
    async fn get(&self, key: &str) -> IdempotencyResult<Option<CachedResponse>>;

    /// Store a response, replacing any previous value, for `ttl`
    async fn set(&self, key: &str, response: &CachedResponse, ttl: Duration)
        -> IdempotencyResult<()>;

    /// Acquire exclusive ownership of `key`.
    ///
    /// Waits for a bounded time only; contention is reported as
    /// [`IdempotencyError::RequestInProgress`](crate::core::error::IdempotencyError::RequestInProgress).
    async fn lock(&self, key: &str) -> IdempotencyResult<LockGuard>;

    /// Perform health check
    async fn health_check(&self) -> IdempotencyResult<bool>;

    /// Backend name used in logs
    fn name(&self) -> &'static str;
}

/// Header values are stored base64 encoded so bytes outside UTF-8 survive
mod header_map_serde {
    use axum::http::{HeaderMap, HeaderName, HeaderValue};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S: Serializer>(headers: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(headers.keys().map(|name| {
            let values: Vec<String> = headers
                .get_all(name)
                .iter()
                .map(|value| STANDARD.encode(value.as_bytes()))
                .collect();
            (name.as_str(), values)
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HeaderMap, D::Error> {
        let raw: HashMap<String, Vec<String>> = HashMap::deserialize(deserializer)?;
        let mut headers = HeaderMap::new();

        for (name, values) in raw {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(D::Error::custom)?;
            for value in values {
                let bytes = STANDARD.decode(value.as_bytes()).map_err(D::Error::custom)?;
                let value = HeaderValue::from_bytes(&bytes).map_err(D::Error::custom)?;
                headers.append(name.clone(), value);
            }
        }

        Ok(headers)
    }
}

mod body_serde {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::{CONTENT_TYPE, SET_COOKIE};
    use axum::http::HeaderValue;

    fn sample_response() -> CachedResponse {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));

        CachedResponse::new(StatusCode::CREATED, headers, Bytes::from_static(b"{\"ok\":true}"))
    }

    #[test]
    fn test_record_keeps_multi_valued_headers() {
        let response = sample_response();
        let decoded = CachedResponse::decode(&response.encode().unwrap()).unwrap();

        assert_eq!(decoded, response);
        let cookies: Vec<_> = decoded.headers.get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[test]
    fn test_record_layout() {
        let response = sample_response();
        let value: serde_json::Value = serde_json::from_slice(&response.encode().unwrap()).unwrap();

        assert_eq!(value["status"], 201);
        assert_eq!(value["headers"]["content-type"][0], "YXBwbGljYXRpb24vanNvbg==");
        assert_eq!(value["body"], "eyJvayI6dHJ1ZX0=");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_binary_body_survives_encoding() {
        let body: Vec<u8> = (0..=255u8).collect();
        let response = CachedResponse::new(StatusCode::OK, HeaderMap::new(), Bytes::from(body.clone()));

        let decoded = CachedResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded.body.as_ref(), body.as_slice());
    }

    #[test]
    fn test_non_utf8_header_value_survives_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert("x-name", HeaderValue::from_bytes(b"caf\xe9").unwrap());
        let response = CachedResponse::new(StatusCode::OK, headers, Bytes::new());

        let decoded = CachedResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded.headers.get("x-name").unwrap().as_bytes(), b"caf\xe9");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(CachedResponse::decode(b"not json").is_err());
    }

    #[test]
    fn test_unknown_status_falls_back() {
        let mut response = sample_response();
        response.status = 42;
        assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
