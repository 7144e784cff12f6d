//! C4 — `Limiter`: global/per-requester concurrency gates, a per-model token
//! bucket, and a per-domain scrape backoff table.
//!
//! The concurrency gates are `tokio::sync::Semaphore`s — FIFO-fair by
//! construction and already the donor crate's async runtime dependency — acquired
//! with `tokio::time::timeout` against the caller's deadline. The token bucket and
//! domain-backoff table are `dashmap::DashMap` entries updated under the shortest
//! possible critical section (§5: "no lock spans an outbound I/O call").

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::error::EngineError;

const BACKOFF_INITIAL: Duration = Duration::from_secs(60);
const BACKOFF_MAX: Duration = Duration::from_secs(3600);
const ROBOTS_BLOCK_TTL: Duration = Duration::from_secs(24 * 3600);

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: f64) -> Self {
        TokenBucket {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, n: f64) -> bool {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    fn refund(&mut self, n: f64) {
        self.refill();
        self.tokens = (self.tokens + n).min(self.capacity);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackoffReason {
    None,
    Failure,
    RobotsDisallow,
}

struct DomainBackoffEntry {
    earliest_next_fetch: Instant,
    consecutive_failures: u32,
    last_reason: BackoffReason,
}

impl Default for DomainBackoffEntry {
    fn default() -> Self {
        DomainBackoffEntry {
            earliest_next_fetch: Instant::now(),
            consecutive_failures: 0,
            last_reason: BackoffReason::None,
        }
    }
}

/// Held permits for a single outbound LLM call; dropping it releases both the
/// global and per-requester gates. Returned by [`Limiter::acquire_llm_slot`].
pub struct LlmSlot {
    _global: OwnedSemaphorePermit,
    _per_user: OwnedSemaphorePermit,
}

/// Global/per-requester concurrency gates, token buckets, and domain backoff.
pub struct Limiter {
    global: Arc<Semaphore>,
    per_user: DashMap<String, Arc<Semaphore>>,
    k_user: usize,
    buckets: DashMap<String, Mutex<TokenBucket>>,
    bucket_capacity: u32,
    bucket_refill: f64,
    domain_backoff: DashMap<String, Mutex<DomainBackoffEntry>>,
    domain_fetch_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Limiter {
    pub fn new(k_global: usize, k_user: usize, bucket_capacity: u32, bucket_refill: f64) -> Self {
        Limiter {
            global: Arc::new(Semaphore::new(k_global)),
            per_user: DashMap::new(),
            k_user,
            buckets: DashMap::new(),
            bucket_capacity,
            bucket_refill,
            domain_backoff: DashMap::new(),
            domain_fetch_locks: DashMap::new(),
        }
    }

    fn per_user_semaphore(&self, requester_id: &str) -> Arc<Semaphore> {
        self.per_user
            .entry(requester_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.k_user)))
            .clone()
    }

    /// Acquire both the global and per-requester gate, waiting FIFO up to
    /// `deadline`. Returns `Fails(Throttled)` if the deadline elapses first.
    pub async fn acquire_llm_slot(
        &self,
        requester_id: &str,
        deadline: Duration,
    ) -> Result<LlmSlot, EngineError> {
        let started = Instant::now();
        let global = self.global.clone();
        let global_permit = timeout(deadline, global.acquire_owned())
            .await
            .map_err(|_| EngineError::Throttled {
                retry_after: deadline,
            })?
            .expect("semaphore never closed");

        let remaining = deadline.saturating_sub(started.elapsed());
        let per_user = self.per_user_semaphore(requester_id);
        let per_user_permit = timeout(remaining, per_user.acquire_owned())
            .await
            .map_err(|_| EngineError::Throttled {
                retry_after: remaining,
            })?
            .expect("semaphore never closed");

        Ok(LlmSlot {
            _global: global_permit,
            _per_user: per_user_permit,
        })
    }

    /// Pre-charge one token from `model_id`'s bucket. Call [`Limiter::refund_token`]
    /// if the call that consumed it turns out not to have happened (§4.6:
    /// "the bucket pre-charges, post-corrects on response").
    pub async fn try_consume_token(&self, model_id: &str) -> Result<(), EngineError> {
        let bucket = self
            .buckets
            .entry(model_id.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(self.bucket_capacity, self.bucket_refill)));
        let mut guard = bucket.lock().await;
        if guard.try_consume(1.0) {
            Ok(())
        } else {
            Err(EngineError::Throttled {
                retry_after: Duration::from_secs_f64(1.0 / self.bucket_refill.max(0.001)),
            })
        }
    }

    pub async fn refund_token(&self, model_id: &str) {
        if let Some(bucket) = self.buckets.get(model_id) {
            bucket.lock().await.refund(1.0);
        }
    }

    /// Check whether `domain` may be fetched right now. `Ok(())` means go ahead;
    /// `Err(Throttled { retry_after })` means wait that long first.
    pub async fn can_fetch(&self, domain: &str) -> Result<(), EngineError> {
        let entry = self
            .domain_backoff
            .entry(domain.to_string())
            .or_insert_with(|| Mutex::new(DomainBackoffEntry::default()));
        let guard = entry.lock().await;
        let now = Instant::now();
        if now >= guard.earliest_next_fetch {
            Ok(())
        } else {
            Err(EngineError::Throttled {
                retry_after: guard.earliest_next_fetch - now,
            })
        }
    }

    /// Record a successful fetch to `domain`: resets the failure streak (§4.4).
    pub async fn record_fetch_success(&self, domain: &str) {
        let entry = self
            .domain_backoff
            .entry(domain.to_string())
            .or_insert_with(|| Mutex::new(DomainBackoffEntry::default()));
        let mut guard = entry.lock().await;
        guard.consecutive_failures = 0;
        guard.last_reason = BackoffReason::None;
        guard.earliest_next_fetch = Instant::now();
    }

    /// Record a failed fetch: doubles the backoff starting at 60s up to 3600s.
    pub async fn record_fetch_failure(&self, domain: &str) {
        let entry = self
            .domain_backoff
            .entry(domain.to_string())
            .or_insert_with(|| Mutex::new(DomainBackoffEntry::default()));
        let mut guard = entry.lock().await;
        guard.consecutive_failures += 1;
        let backoff = (BACKOFF_INITIAL * 2u32.saturating_pow(guard.consecutive_failures.saturating_sub(1)))
            .min(BACKOFF_MAX);
        guard.last_reason = BackoffReason::Failure;
        guard.earliest_next_fetch = Instant::now() + backoff;
    }

    /// Serialise actual fetches to `domain` to one at a time (§5: "concurrent
    /// fetches to the same domain are limited to one at a time to give
    /// backoff time to settle"). Distinct from [`Limiter::can_fetch`], which
    /// only checks the backoff schedule — this is the mutual-exclusion half.
    pub async fn acquire_domain_fetch_lock(&self, domain: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .domain_fetch_locks
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Record a `robots.txt` disallow: a hard 24h block regardless of the
    /// exponential schedule (§4.4).
    pub async fn record_robots_disallow(&self, domain: &str) {
        let entry = self
            .domain_backoff
            .entry(domain.to_string())
            .or_insert_with(|| Mutex::new(DomainBackoffEntry::default()));
        let mut guard = entry.lock().await;
        guard.last_reason = BackoffReason::RobotsDisallow;
        guard.earliest_next_fetch = Instant::now() + ROBOTS_BLOCK_TTL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn global_gate_limits_concurrency() {
        let limiter = Arc::new(Limiter::new(1, 5, 60, 1.0));
        let _slot = limiter.acquire_llm_slot("u1", Duration::from_millis(50)).await.unwrap();
        let result = limiter.acquire_llm_slot("u2", Duration::from_millis(30)).await;
        assert!(matches!(result, Err(EngineError::Throttled { .. })));
    }

    #[tokio::test]
    async fn per_user_gate_does_not_block_other_users() {
        let limiter = Arc::new(Limiter::new(5, 1, 60, 1.0));
        let _slot = limiter.acquire_llm_slot("u1", Duration::from_millis(50)).await.unwrap();
        // u1's own second call should be throttled by its own per-user gate...
        let blocked = limiter.acquire_llm_slot("u1", Duration::from_millis(20)).await;
        assert!(matches!(blocked, Err(EngineError::Throttled { .. })));
        // ...but u2 is unaffected.
        let ok = limiter.acquire_llm_slot("u2", Duration::from_millis(20)).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn token_bucket_throttles_after_capacity_exhausted() {
        let limiter = Limiter::new(5, 5, 2, 0.0);
        assert!(limiter.try_consume_token("gpt").await.is_ok());
        assert!(limiter.try_consume_token("gpt").await.is_ok());
        assert!(limiter.try_consume_token("gpt").await.is_err());
    }

    #[tokio::test]
    async fn refund_restores_a_token() {
        let limiter = Limiter::new(5, 5, 1, 0.0);
        assert!(limiter.try_consume_token("gpt").await.is_ok());
        assert!(limiter.try_consume_token("gpt").await.is_err());
        limiter.refund_token("gpt").await;
        assert!(limiter.try_consume_token("gpt").await.is_ok());
    }

    #[tokio::test]
    async fn fresh_domain_is_fetchable_immediately() {
        let limiter = Limiter::new(5, 5, 60, 1.0);
        assert!(limiter.can_fetch("example.com").await.is_ok());
    }

    #[tokio::test]
    async fn backoff_blocks_fetch_until_earliest_next_fetch() {
        let limiter = Limiter::new(5, 5, 60, 1.0);
        limiter.record_fetch_failure("bad.example.com").await;
        let result = limiter.can_fetch("bad.example.com").await;
        assert!(matches!(result, Err(EngineError::Throttled { .. })));
    }

    #[tokio::test]
    async fn domain_fetch_lock_serialises_concurrent_holders() {
        let limiter = Arc::new(Limiter::new(5, 5, 60, 1.0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let l1 = limiter.clone();
        let o1 = order.clone();
        let first = tokio::spawn(async move {
            let _guard = l1.acquire_domain_fetch_lock("example.com").await;
            tokio::time::sleep(Duration::from_millis(30)).await;
            o1.lock().await.push(1);
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let l2 = limiter.clone();
        let o2 = order.clone();
        let second = tokio::spawn(async move {
            let _guard = l2.acquire_domain_fetch_lock("example.com").await;
            o2.lock().await.push(2);
        });

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(*order.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn success_resets_backoff() {
        let limiter = Limiter::new(5, 5, 60, 1.0);
        limiter.record_fetch_failure("flaky.example.com").await;
        limiter.record_fetch_success("flaky.example.com").await;
        assert!(limiter.can_fetch("flaky.example.com").await.is_ok());
    }
}
