//! # Idempotency Module
//!
//! Request deduplication for mutating HTTP requests. Callers opt in by sending
//! an idempotency key header; retries of the same request then receive the
//! original response instead of running the handler again.
//!
//! ## Architecture
//! 1. **Fingerprinting**: idempotency key + SHA-256 of method, path and body
//! 2. **Stores**: in-memory and Redis implementations of [`IdempotencyStore`]
//! 3. **Middleware**: tower layer running lock → lookup → execute → cache
//! 4. **Capture**: body decorator recording the response while it streams out
//!
//! ## Usage Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use axum::{routing::post, Router};
//! use idempotency_gateway::idempotency::{IdempotencyLayer, InMemoryStore, InMemoryStoreConfig};
//!
//! # async fn example() {
//! let store = Arc::new(InMemoryStore::new(InMemoryStoreConfig::default()));
//! let app: Router = Router::new()
//!     .route("/api/payment", post(|| async { "{\"ok\":true}" }))
//!     .layer(IdempotencyLayer::new(store));
//! # }
//! ```

pub mod capture;
pub mod fingerprint;
pub mod middleware;
pub mod stores;

pub use capture::TeeBody;
pub use fingerprint::{Fingerprinter, Sha256Fingerprinter};
pub use middleware::{is_idempotency_method, IdempotencyLayer, IdempotencyService, CACHED_HEADER};
pub use stores::{
    CachedResponse, IdempotencyStore, InMemoryStore, InMemoryStoreConfig, LockGuard, LockRelease,
    RedisStore, RedisStoreConfig,
};

use crate::core::error::{IdempotencyError, IdempotencyResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default header carrying the idempotency key
pub const DEFAULT_HEADER_NAME: &str = "Idempotency-Key";

/// Default lifetime of a cached response
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default limit for buffered request bodies.
///
/// Fingerprinting needs the whole body in memory, so the limit bounds memory
/// per in-flight request. Larger idempotent requests are rejected with 400
/// until `max_body_size` is raised.
pub const DEFAULT_MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// Middleware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Header carrying the idempotency key
    pub header_name: String,

    /// How long a captured response is replayed
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Largest request body that can be fingerprinted, in bytes.
    ///
    /// Bodies above this get 400 rather than being buffered without bound;
    /// raise it for endpoints that accept large uploads.
    pub max_body_size: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            header_name: DEFAULT_HEADER_NAME.to_string(),
            ttl: DEFAULT_TTL,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// Store backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-process maps, single instance only
    Memory(InMemoryStoreConfig),

    /// Shared Redis, safe across instances
    Redis(RedisStoreConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory(InMemoryStoreConfig::default())
    }
}

impl StoreConfig {
    /// Build the configured backend
    pub async fn build_store(&self) -> IdempotencyResult<Arc<dyn IdempotencyStore>> {
        let store: Arc<dyn IdempotencyStore> = match self {
            Self::Memory(config) => Arc::new(InMemoryStore::new(config.clone())),
            Self::Redis(config) => Arc::new(RedisStore::new(config.clone()).await?),
        };

        info!("Using {} idempotency store", store.name());
        Ok(store)
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> IdempotencyResult<()> {
        match self {
            Self::Memory(config) => {
                if config.lock_timeout.is_zero() {
                    return Err(IdempotencyError::config("memory lock_timeout must be greater than 0"));
                }
                if config.cleanup_interval.is_zero() {
                    return Err(IdempotencyError::config("memory cleanup_interval must be greater than 0"));
                }
            }
            Self::Redis(config) => {
                if config.url.is_empty() {
                    return Err(IdempotencyError::config("redis url cannot be empty"));
                }
                if config.lock_ttl.is_zero() {
                    return Err(IdempotencyError::config("redis lock_ttl must be greater than 0"));
                }
            }
        }
        Ok(())
    }
}
