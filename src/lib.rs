//! # Idempotency Gateway
//!
//! Tower middleware that makes mutating HTTP requests safe to retry. A caller
//! sends an `Idempotency-Key` header; the first request with a given key and
//! payload runs normally and its response is stored, later identical requests
//! get that response replayed instead of running the handler again.
//!
//! ## Crate layout
//! - [`core`]: error type and application configuration
//! - [`idempotency`]: fingerprinting, stores and the middleware layer
//! - [`observability`]: log subscriber setup

/// Error type and configuration
pub mod core;

/// Fingerprinting, stores and the interception layer
pub mod idempotency;

/// Logging setup
pub mod observability;

pub use crate::core::config::AppConfig;
pub use crate::core::error::{IdempotencyError, IdempotencyResult};
pub use idempotency::{
    CachedResponse, IdempotencyConfig, IdempotencyLayer, IdempotencyStore, InMemoryStore,
    RedisStore, StoreConfig,
};
