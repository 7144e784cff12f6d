//! C3 — `Cache`: content-keyed, TTL-scoped artifact cache with single-flight
//! coalescing.
//!
//! Backed by `dashmap::DashMap`, the same concurrent-map primitive the donor
//! crate already depends on for its process-wide HTTP client pool
//! (`http_client_pool.rs`'s `Lazy<DashMap<String, reqwest::Client>>`). Single
//! flight is implemented with an in-map `Arc<tokio::sync::OnceCell<...>>`
//! placeholder: the first caller to miss inserts the cell and becomes the
//! producer; every other concurrent caller awaits the same cell.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

use crate::error::EngineError;

/// A cached artifact plus its expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

type Slot = Arc<OnceCell<CacheEntry>>;

/// A purpose-partitioned cache. One `Cache` instance is shared (via `Arc`) across
/// the whole process through the `Engine` context (§9 redesign flag) — never a
/// hidden global singleton.
pub struct Cache {
    slots: DashMap<String, Slot>,
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            slots: DashMap::new(),
        }
    }

    fn full_key(purpose: &str, key: &str) -> String {
        format!("{}:{}", purpose, key)
    }

    /// Look up `key` within `purpose`. Returns `None` on a clean miss (no entry
    /// and nobody currently producing one).
    pub async fn get(&self, purpose: &str, key: &str) -> Option<serde_json::Value> {
        let full = Self::full_key(purpose, key);
        let slot = self.slots.get(&full)?.clone();
        match slot.get() {
            Some(entry) if !entry.is_expired() => Some(entry.value.clone()),
            Some(_) => {
                self.slots.remove(&full);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, purpose: &str, key: &str, value: serde_json::Value, ttl: Duration) {
        let full = Self::full_key(purpose, key);
        let slot: Slot = Arc::new(OnceCell::new());
        // set() cannot fail on a freshly constructed OnceCell.
        let _ = slot.set(CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        });
        self.slots.insert(full, slot);
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn invalidate(&self, prefix: &str) {
        self.slots.retain(|k, _| !k.starts_with(prefix));
    }

    /// Sweep every expired entry. Intended to be called on a low-frequency timer
    /// (§4.3); also safe to call from tests.
    pub fn sweep_expired(&self) {
        self.slots.retain(|_, slot| match slot.get() {
            Some(entry) => !entry.is_expired(),
            None => true,
        });
    }

    /// Fetch-or-produce with single-flight coalescing (§4.3, §8 cache coalescing).
    ///
    /// If `key` is already cached (and unexpired), returns it without calling
    /// `produce`. Otherwise, the first caller for `key` runs `produce` and every
    /// concurrent caller for the same key awaits that single call's result rather
    /// than each invoking `produce` themselves.
    pub async fn get_or_produce<F, Fut>(
        &self,
        purpose: &str,
        key: &str,
        ttl: Duration,
        produce: F,
    ) -> Result<serde_json::Value, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<serde_json::Value, EngineError>>,
    {
        let full = Self::full_key(purpose, key);

        let slot = self
            .slots
            .entry(full.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        if let Some(entry) = slot.get() {
            if !entry.is_expired() {
                return Ok(entry.value.clone());
            }
            // Expired: evict and fall through to re-produce under a fresh slot so
            // other waiters on the stale cell aren't handed an expired value.
            self.slots.remove(&full);
            let fresh_slot: Slot = self
                .slots
                .entry(full)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();
            return self.produce_into(&fresh_slot, ttl, produce).await;
        }

        self.produce_into(&slot, ttl, produce).await
    }

    async fn produce_into<F, Fut>(
        &self,
        slot: &Slot,
        ttl: Duration,
        produce: F,
    ) -> Result<serde_json::Value, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<serde_json::Value, EngineError>>,
    {
        // `get_or_try_init` makes every concurrent holder of `slot` await the same
        // producer future; only the winner's closure actually runs.
        let entry = slot
            .get_or_try_init(|| async {
                let value = produce().await?;
                Ok::<CacheEntry, EngineError>(CacheEntry {
                    value,
                    expires_at: Instant::now() + ttl,
                })
            })
            .await?;
        Ok(entry.value.clone())
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}
