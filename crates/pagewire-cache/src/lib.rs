//! Key/value engine behind pagewire's shared state.
//!
//! [`Cache`] is the contract every backend satisfies: strings, hashes, sets,
//! sorted sets, pub/sub channels and named locks. [`MemoryCache`] serves a
//! single process, [`RedisCache`] lets several server processes share pages
//! and sessions. Callers pick one at startup through [`connect`] and pass the
//! resulting handle around explicitly.

mod fanout;
mod lock_table;
pub mod memory;
pub mod redis_cache;
mod scripts;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

pub use memory::MemoryCache;
pub use redis_cache::RedisCache;

/// Hash field holding the running byte size of a session's controls.
pub const SESSION_SIZE_FIELD: &str = "size";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("could not acquire lock {key} after {attempts} attempts")]
    LockExhausted { key: String, attempts: u32 },
    #[error("lock {key} is held by another owner")]
    LockMismatch { key: String },
    #[error("value stored at {key} is not an integer")]
    NotAnInteger { key: String },
    #[error("operation against a key holding the wrong kind of value: {key}")]
    WrongType { key: String },
    #[error("failed to decode hash {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A live subscription to one pub/sub channel. The receiver yields `None`
/// once [`Cache::unsubscribe`] has been called for `id`.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub channel: String,
    pub receiver: mpsc::Receiver<Bytes>,
}

#[async_trait]
pub(crate) trait Release: Send {
    async fn release(&mut self) -> CacheResult<()>;
}

/// Ownership of a named lock. Call [`LockGuard::unlock`] to release it and
/// observe release errors; dropping the guard also releases it.
pub struct LockGuard {
    key: String,
    inner: Option<Box<dyn Release>>,
}

impl LockGuard {
    pub(crate) fn new(key: &str, inner: Box<dyn Release>) -> Self {
        Self {
            key: key.to_string(),
            inner: Some(inner),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn unlock(mut self) -> CacheResult<()> {
        match self.inner.take() {
            Some(mut inner) => inner.release().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    async fn get_string(&self, key: &str) -> CacheResult<Option<String>>;

    /// Stores `value`, replacing any previous value and expiration.
    async fn set_string(&self, key: &str, value: &str, expires: Option<Duration>)
        -> CacheResult<()>;

    /// Adds `by` to the integer at `key` (missing keys count as zero). When
    /// `expires` is set the expiration is applied atomically with the increment.
    async fn increment(&self, key: &str, by: i64, expires: Option<Duration>) -> CacheResult<i64>;

    async fn remove(&self, keys: &[String]) -> CacheResult<()>;

    /// Sets an absolute expiration deadline measured from now.
    async fn expire(&self, key: &str, expires: Duration) -> CacheResult<()>;

    async fn hash_set(&self, key: &str, fields: &[(&str, &str)]) -> CacheResult<()>;

    async fn hash_get(&self, key: &str, field: &str) -> CacheResult<Option<String>>;

    async fn hash_get_all(&self, key: &str) -> CacheResult<HashMap<String, String>>;

    async fn hash_increment(&self, key: &str, field: &str, by: i64) -> CacheResult<i64>;

    /// Removes fields; the key disappears with its last field.
    async fn hash_remove(&self, key: &str, fields: &[&str]) -> CacheResult<()>;

    async fn set_add(&self, key: &str, member: &str) -> CacheResult<()>;

    /// Returns whether `member` was present. The key disappears with its last member.
    async fn set_remove(&self, key: &str, member: &str) -> CacheResult<bool>;

    async fn set_members(&self, key: &str) -> CacheResult<Vec<String>>;

    async fn sorted_set_add(&self, key: &str, member: &str, score: i64) -> CacheResult<()>;

    /// Atomically returns and removes every member scored within `[min, max]`.
    async fn sorted_set_pop_range(&self, key: &str, min: i64, max: i64)
        -> CacheResult<Vec<String>>;

    async fn sorted_set_remove(&self, key: &str, member: &str) -> CacheResult<()>;

    async fn subscribe(&self, channel: &str) -> CacheResult<Subscription>;

    async fn unsubscribe(&self, id: SubscriptionId) -> CacheResult<()>;

    async fn publish(&self, channel: &str, message: Bytes) -> CacheResult<()>;

    /// Blocks until the named lock is owned by the caller.
    async fn lock(&self, key: &str) -> CacheResult<LockGuard>;

    /// Upserts `control_id` in `controls_key` while keeping the byte total in
    /// `session_key`'s size field current. Returns `false` without writing
    /// anything when the new total would exceed `max_size` (zero disables
    /// the cap).
    async fn set_session_control(
        &self,
        session_key: &str,
        controls_key: &str,
        control_id: &str,
        control_json: &str,
        max_size: usize,
    ) -> CacheResult<bool>;

    async fn remove_session_control(
        &self,
        session_key: &str,
        controls_key: &str,
        control_id: &str,
    ) -> CacheResult<()>;
}

#[async_trait]
pub trait CacheExt: Cache {
    /// Reads a whole hash into `T`, treating each field as a JSON string value.
    async fn hash_scan<T>(&self, key: &str) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let fields = self.hash_get_all(key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let object = fields
            .into_iter()
            .map(|(field, value)| (field, serde_json::Value::String(value)))
            .collect::<serde_json::Map<_, _>>();
        serde_json::from_value(serde_json::Value::Object(object))
            .map(Some)
            .map_err(|source| CacheError::Decode {
                key: key.to_string(),
                source,
            })
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

/// Process-wide cache handle plus the background tasks its backend needs.
pub struct CacheHandle {
    cache: Arc<dyn Cache>,
    background: Vec<JoinHandle<()>>,
}

impl CacheHandle {
    pub fn cache(&self) -> Arc<dyn Cache> {
        Arc::clone(&self.cache)
    }

    pub fn shutdown(self) {
        for task in self.background {
            task.abort();
        }
    }
}

/// Opens the networked backend when `redis_url` is set, the in-process one otherwise.
pub async fn connect(redis_url: Option<&str>) -> CacheResult<CacheHandle> {
    match redis_url {
        Some(url) => {
            let cache = RedisCache::connect(url).await?;
            info!(backend = "redis", "cache connected");
            Ok(CacheHandle {
                cache: Arc::new(cache),
                background: Vec::new(),
            })
        }
        None => {
            let cache = Arc::new(MemoryCache::new());
            let sweeper = cache.spawn_sweeper(memory::DEFAULT_SWEEP_INTERVAL);
            info!(backend = "memory", "cache initialised");
            Ok(CacheHandle {
                cache,
                background: vec![sweeper],
            })
        }
    }
}
