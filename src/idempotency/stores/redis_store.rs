//! # Redis Idempotency Store
//!
//! Shares cached responses and locks between processes through Redis.
//!
//! ## Key layout
//! - `{prefix}{fingerprint}` holds the encoded [`CachedResponse`] with the
//!   response TTL.
//! - `{prefix}lock:{fingerprint}` holds a random token with the lock TTL. The
//!   TTL lets a crashed holder's lock lapse instead of wedging the key.

use super::{CachedResponse, IdempotencyStore, LockGuard, LockRelease};
use crate::core::error::{IdempotencyError, IdempotencyResult};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, RedisResult, Script};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Deletes the lock only while it still carries our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub url: String,

    /// Ceiling after which an unreleased lock expires by itself
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,

    /// Prefix prepended to every key
    pub key_prefix: String,

    /// Maximum number of retries for a failed command
    pub max_retries: u32,

    /// Base delay between retries, multiplied by the attempt number
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            lock_ttl: Duration::from_secs(30),
            key_prefix: String::new(),
            max_retries: 2,
            retry_delay: Duration::from_millis(50),
        }
    }
}

/// Networked backend
pub struct RedisStore {
    config: RedisStoreConfig,

    connection: ConnectionManager,

    release_script: Arc<Script>,

    connection_errors: Arc<AtomicU64>,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn new(config: RedisStoreConfig) -> IdempotencyResult<Self> {
        let client = Client::open(config.url.as_str())?;
        let connection = ConnectionManager::new(client).await?;

        info!("Redis idempotency store connected to {}", config.url);

        Ok(Self {
            config,
            connection,
            release_script: Arc::new(Script::new(RELEASE_SCRIPT)),
            connection_errors: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Key holding the cached response
    fn cache_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Key holding the lock token
    fn lock_key(&self, key: &str) -> String {
        lock_key(&self.config.key_prefix, key)
    }

    /// `SET NX PX` the lock key to `token`.
    ///
    /// A retried `SET NX` reports nil when an earlier attempt landed but its
    /// reply was lost, so a nil reply is checked against the current holder.
    async fn try_acquire(&self, lock_key: &str, token: &str, lock_ttl_ms: u64) -> IdempotencyResult<bool> {
        let reply: Option<String> = self
            .execute_with_retry(move |mut conn| async move {
                redis::cmd("SET")
                    .arg(lock_key)
                    .arg(token)
                    .arg("NX")
                    .arg("PX")
                    .arg(lock_ttl_ms)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        if reply.is_some() {
            return Ok(true);
        }

        let holder: Option<String> = self
            .execute_with_retry(move |mut conn| async move {
                redis::cmd("GET").arg(lock_key).query_async(&mut conn).await
            })
            .await?;

        Ok(holds_lock(holder.as_deref(), token))
    }

    /// Number of failed Redis commands since start-up
    pub fn connection_errors(&self) -> u64 {
        self.connection_errors.load(Ordering::Relaxed)
    }

    /// Execute a Redis operation with retry logic.
    ///
    /// Each attempt gets its own handle to the multiplexed connection; the
    /// connection manager reconnects in the background.
    async fn execute_with_retry<T, F, Fut>(&self, operation: F) -> IdempotencyResult<T>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let mut retries = 0;

        loop {
            match operation(self.connection.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let total = self.connection_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    error!(connection_errors = total, "Redis operation failed: {}", e);

                    if retries >= self.config.max_retries || !is_transient(&e) {
                        return Err(IdempotencyError::Redis(e));
                    }

                    retries += 1;
                    tokio::time::sleep(self.config.retry_delay * retries).await;
                }
            }
        }
    }
}

fn lock_key(prefix: &str, key: &str) -> String {
    format!("{}lock:{}", prefix, key)
}

fn holds_lock(holder: Option<&str>, token: &str) -> bool {
    holder == Some(token)
}

fn is_transient(error: &redis::RedisError) -> bool {
    error.is_io_error() || error.is_connection_dropped() || error.is_timeout()
}

/// Milliseconds for `PX`, never zero since Redis rejects that
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

struct RedisLockRelease {
    connection: ConnectionManager,
    script: Arc<Script>,
    lock_key: String,
    token: String,
}

#[async_trait]
impl LockRelease for RedisLockRelease {
    async fn release(self: Box<Self>) {
        let mut conn = self.connection.clone();
        let result: RedisResult<i64> = self
            .script
            .key(&self.lock_key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok(1) => debug!("Released Redis lock {}", self.lock_key),
            Ok(_) => warn!(
                "Redis lock {} expired before release; another holder may have run",
                self.lock_key
            ),
            // The lock TTL frees the key eventually
            Err(e) => warn!("Failed to release Redis lock {}: {}", self.lock_key, e),
        }
    }
}

#[async_trait]
impl IdempotencyStore for RedisStore {
    async fn get(&self, key: &str) -> IdempotencyResult<Option<CachedResponse>> {
        let full_key = self.cache_key(key);
        let full_key = full_key.as_str();

        let data: Option<Vec<u8>> = self
            .execute_with_retry(move |mut conn| async move {
                redis::cmd("GET").arg(full_key).query_async(&mut conn).await
            })
            .await?;

        match data {
            Some(data) => {
                debug!("Redis idempotency hit for key: {}", key);
                Ok(Some(CachedResponse::decode(&data)?))
            }
            None => {
                debug!("Redis idempotency miss for key: {}", key);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, response: &CachedResponse, ttl: Duration) -> IdempotencyResult<()> {
        let full_key = self.cache_key(key);
        let full_key = full_key.as_str();
        let data = response.encode()?;
        let data = data.as_slice();
        let ttl_ms = ttl_millis(ttl);

        self.execute_with_retry(move |mut conn| async move {
            redis::cmd("SET")
                .arg(full_key)
                .arg(data)
                .arg("PX")
                .arg(ttl_ms)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await?;

        debug!("Set Redis idempotency key: {} with TTL: {:?}", key, ttl);
        Ok(())
    }

    async fn lock(&self, key: &str) -> IdempotencyResult<LockGuard> {
        let lock_key = self.lock_key(key);
        let token = Uuid::new_v4().to_string();
        let lock_ttl_ms = ttl_millis(self.config.lock_ttl);

        let acquired = self.try_acquire(&lock_key, &token, lock_ttl_ms).await?;

        if !acquired {
            debug!("Redis lock {} is held elsewhere", lock_key);
            return Err(IdempotencyError::RequestInProgress);
        }

        Ok(LockGuard::new(
            key,
            Box::new(RedisLockRelease {
                connection: self.connection.clone(),
                script: Arc::clone(&self.release_script),
                lock_key,
                token,
            }),
        ))
    }

    async fn health_check(&self) -> IdempotencyResult<bool> {
        let result: IdempotencyResult<String> = self
            .execute_with_retry(|mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await;

        match result {
            Ok(response) => Ok(response == "PONG"),
            Err(e) => {
                warn!(
                    connection_errors = self.connection_errors(),
                    "Redis health check failed: {}", e
                );
                Ok(false)
            }
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
