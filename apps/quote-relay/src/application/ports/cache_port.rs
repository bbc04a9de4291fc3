//! Cache Port (Driven Port)
//!
//! Key/value store with per-entry TTL. Values cross the boundary as JSON
//! text; [`get_json`] and [`set_json`] give typed access on top.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Cache failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Store unreachable.
    #[error("cache unavailable: {message}")]
    Unavailable {
        /// Error details.
        message: String,
    },

    /// Value could not be encoded for storage.
    #[error("cache serialization error: {message}")]
    Serialization {
        /// Error details.
        message: String,
    },
}

/// Port for the shared cache.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a live value. Expired or missing keys read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Write a value. A zero `ttl` stores it without expiry.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Whether the store answers.
    async fn ping(&self) -> bool;
}

/// Read and decode a JSON value.
///
/// Malformed stored data reads as `None` so a corrupt entry heals on the
/// next write.
///
/// # Errors
///
/// Returns the store's error if the read itself fails.
pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn CacheStore,
    key: &str,
) -> Result<Option<T>, CacheError> {
    let Some(raw) = cache.get(key).await? else {
        return Ok(None);
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(key, error = %e, "Discarding malformed cached value");
            Ok(None)
        }
    }
}

/// Encode a value as JSON and write it.
///
/// # Errors
///
/// Returns [`CacheError::Serialization`] if encoding fails, or the store's
/// error if the write fails.
pub async fn set_json<T: Serialize + Sync + ?Sized>(
    cache: &dyn CacheStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value).map_err(|e| CacheError::Serialization {
        message: e.to_string(),
    })?;
    cache.set(key, raw, ttl).await
}
