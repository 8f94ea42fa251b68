//! # In-Memory Idempotency Store
//!
//! Keeps cached responses and per-fingerprint locks in process memory.
//! Expiry is checked inline on every read, and a background sweep reclaims
//! memory held by entries nobody asks for again.

use super::{CachedResponse, IdempotencyStore, LockGuard, LockRelease};
use crate::core::error::{IdempotencyError, IdempotencyResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::interval;
use tracing::debug;

/// In-memory store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryStoreConfig {
    /// How long `lock` waits for a busy key before reporting a conflict
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// Interval of the expired entry sweep
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for InMemoryStoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(100),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    response: Arc<CachedResponse>,
    expires_at: Instant,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process backend.
///
/// Lock entries are created lazily and never removed; only the state of their
/// mutex cycles.
pub struct InMemoryStore {
    config: InMemoryStoreConfig,

    entries: Arc<DashMap<String, StoredEntry>>,

    locks: DashMap<String, Arc<Mutex<()>>>,

    cleanup_task: tokio::task::JoinHandle<()>,
}

impl InMemoryStore {
    /// Create a new store and start its cleanup task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: InMemoryStoreConfig) -> Self {
        let entries = Arc::new(DashMap::new());

        let cleanup_task = {
            let entries = Arc::clone(&entries);
            let cleanup_interval = config.cleanup_interval;

            tokio::spawn(async move {
                let mut interval = interval(cleanup_interval);
                // First tick completes immediately
                interval.tick().await;
                loop {
                    interval.tick().await;
                    Self::cleanup_expired_entries(&entries);
                }
            })
        };

        Self {
            config,
            entries,
            locks: DashMap::new(),
            cleanup_task,
        }
    }

    /// Remove every entry past its expiry, returning how many were dropped
    fn cleanup_expired_entries(entries: &DashMap<String, StoredEntry>) -> usize {
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let cleaned = before.saturating_sub(entries.len());

        if cleaned > 0 {
            debug!("Cleaned up {} expired idempotency entries", cleaned);
        }
        cleaned
    }

    /// Run the expiry sweep now
    pub fn purge_expired(&self) -> usize {
        Self::cleanup_expired_entries(&self.entries)
    }

    /// Number of stored responses, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Per-key mutex, created on first use.
    ///
    /// The entry API holds the shard lock across lookup and insert, so
    /// concurrent first callers end up sharing one mutex.
    fn key_mutex(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.get(key) {
            return Arc::clone(existing.value());
        }

        let entry = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }
}

impl Drop for InMemoryStore {
    fn drop(&mut self) {
        self.cleanup_task.abort();
    }
}

struct MemoryLockRelease {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl LockRelease for MemoryLockRelease {
    async fn release(self: Box<Self>) {
        // Dropping the owned guard unlocks the mutex
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn get(&self, key: &str) -> IdempotencyResult<Option<CachedResponse>> {
        let now = Instant::now();

        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                return Ok(Some(entry.response.as_ref().clone()));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            // Re-check under the write lock; a concurrent set may have refreshed it
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }

        Ok(None)
    }

    async fn set(&self, key: &str, response: &CachedResponse, ttl: Duration) -> IdempotencyResult<()> {
        let entry = StoredEntry {
            response: Arc::new(response.clone()),
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn lock(&self, key: &str) -> IdempotencyResult<LockGuard> {
        let mutex = self.key_mutex(key);

        match tokio::time::timeout(self.config.lock_timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(LockGuard::new(
                key,
                Box::new(MemoryLockRelease { _guard: guard }),
            )),
            Err(_) => {
                debug!(key = %key, "Timed out waiting for idempotency lock");
                Err(IdempotencyError::RequestInProgress)
            }
        }
    }

    async fn health_check(&self) -> IdempotencyResult<bool> {
        Ok(!self.cleanup_task.is_finished())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
