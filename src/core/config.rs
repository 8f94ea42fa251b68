//! # Configuration
//!
//! Application configuration loaded from a YAML file, then overridden from
//! the environment, then validated.
//!
//! Environment variables follow the pattern `IDEMPOTENCY_<SECTION>_<FIELD>`,
//! for example `IDEMPOTENCY_SERVER_BIND_ADDRESS=0.0.0.0:8080` or
//! `IDEMPOTENCY_TTL=12h`. Durations use humantime syntax (`100ms`, `30s`, `24h`).

use crate::core::error::{IdempotencyError, IdempotencyResult};
use crate::idempotency::{IdempotencyConfig, InMemoryStoreConfig, RedisStoreConfig, StoreConfig};
use crate::observability::config::{LogConfig, LogFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP listener settings
    pub server: ServerConfig,

    /// Middleware behaviour
    pub idempotency: IdempotencyConfig,

    /// Store backend
    pub store: StoreConfig,

    /// Log output
    pub logging: LogConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the demo server binds to
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> IdempotencyResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            IdempotencyError::config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults and the environment only
    pub fn load_from_env() -> IdempotencyResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without applying overrides
    pub fn from_yaml(content: &str) -> IdempotencyResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| IdempotencyError::config(format!("Failed to parse YAML config: {}", e)))
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) -> IdempotencyResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source
    fn apply_overrides<F>(&mut self, var: F) -> IdempotencyResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = var("IDEMPOTENCY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Some(header) = var("IDEMPOTENCY_HEADER_NAME") {
            self.idempotency.header_name = header;
        }

        if let Some(ttl) = var("IDEMPOTENCY_TTL") {
            self.idempotency.ttl = parse_duration("IDEMPOTENCY_TTL", &ttl)?;
        }

        if let Some(size) = var("IDEMPOTENCY_MAX_BODY_SIZE") {
            self.idempotency.max_body_size = size.parse().map_err(|e| {
                IdempotencyError::config(format!("Invalid IDEMPOTENCY_MAX_BODY_SIZE: {}", e))
            })?;
        }

        // Setting a Redis URL switches the backend
        if let Some(url) = var("IDEMPOTENCY_REDIS_URL") {
            if let StoreConfig::Redis(redis) = &mut self.store {
                redis.url = url;
            } else {
                self.store = StoreConfig::Redis(RedisStoreConfig {
                    url,
                    ..Default::default()
                });
            }
        }

        match &mut self.store {
            StoreConfig::Memory(memory) => apply_memory_overrides(memory, &var)?,
            StoreConfig::Redis(redis) => {
                if let Some(ttl) = var("IDEMPOTENCY_REDIS_LOCK_TTL") {
                    redis.lock_ttl = parse_duration("IDEMPOTENCY_REDIS_LOCK_TTL", &ttl)?;
                }
                if let Some(prefix) = var("IDEMPOTENCY_REDIS_KEY_PREFIX") {
                    redis.key_prefix = prefix;
                }
            }
        }

        if let Some(level) = var("IDEMPOTENCY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = var("IDEMPOTENCY_LOG_FORMAT") {
            self.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(IdempotencyError::config(format!(
                        "Invalid IDEMPOTENCY_LOG_FORMAT: {}",
                        other
                    )))
                }
            };
        }

        Ok(())
    }

    /// Configuration validation with every problem reported at once
    pub fn validate(&self) -> IdempotencyResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("server.bind_address cannot be empty".to_string());
        }

        if self.idempotency.header_name.is_empty() {
            errors.push("idempotency.header_name cannot be empty".to_string());
        }

        if self.idempotency.ttl.is_zero() {
            errors.push("idempotency.ttl must be greater than 0".to_string());
        }

        if self.idempotency.max_body_size == 0 {
            errors.push("idempotency.max_body_size must be greater than 0".to_string());
        }

        if let Err(e) = self.store.validate() {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(IdempotencyError::config(errors.join("; ")))
        }
    }
}

fn apply_memory_overrides<F>(memory: &mut InMemoryStoreConfig, var: &F) -> IdempotencyResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(timeout) = var("IDEMPOTENCY_MEMORY_LOCK_TIMEOUT") {
        memory.lock_timeout = parse_duration("IDEMPOTENCY_MEMORY_LOCK_TIMEOUT", &timeout)?;
    }
    if let Some(interval) = var("IDEMPOTENCY_MEMORY_CLEANUP_INTERVAL") {
        memory.cleanup_interval = parse_duration("IDEMPOTENCY_MEMORY_CLEANUP_INTERVAL", &interval)?;
    }
    Ok(())
}

fn parse_duration(name: &str, value: &str) -> IdempotencyResult<std::time::Duration> {
    humantime::parse_duration(value)
        .map_err(|e| IdempotencyError::config(format!("Invalid {}: {}", name, e)))
}
