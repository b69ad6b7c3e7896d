//! In-process fixed-window rate limiter.
//!
//! Used as the fallback for the distributed limiter and on its own for
//! lower-stakes checks. Counters live in a bounded, insertion-ordered table:
//! every write moves the key to the back, and overflow evicts from the front,
//! which approximates least-recently-used eviction.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::decision::{now_ms, RateDecision};

/// Default bound on the number of tracked keys.
pub const DEFAULT_MAX_BUCKETS: usize = 10_000;
/// Minimum time between two pruning passes.
pub const PRUNE_INTERVAL_MS: u64 = 30_000;

/// Counter state for a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterBucket {
    pub count: u32,
    pub reset_at_ms: u64,
    pub last_seen_ms: u64,
}

#[derive(Default)]
struct BucketTable {
    /// key -> (insertion sequence, bucket)
    entries: HashMap<String, (u64, CounterBucket)>,
    /// insertion sequence -> key, oldest first
    order: BTreeMap<u64, String>,
    next_seq: u64,
    last_prune_ms: u64,
}

impl BucketTable {
    fn get(&self, key: &str) -> Option<CounterBucket> {
        self.entries.get(key).map(|(_, bucket)| *bucket)
    }

    /// Insert or update `key`, moving it to the newest position.
    fn put(&mut self, key: &str, bucket: CounterBucket) {
        let seq = self.next_seq;
        self.next_seq += 1;

        match self.entries.get_mut(key) {
            Some(entry) => {
                self.order.remove(&entry.0);
                *entry = (seq, bucket);
            }
            None => {
                self.entries.insert(key.to_string(), (seq, bucket));
            }
        }
        self.order.insert(seq, key.to_string());
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn prune_expired(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        let order = &mut self.order;
        self.entries.retain(|_, (seq, bucket)| {
            let live = bucket.reset_at_ms > now;
            if !live {
                order.remove(seq);
            }
            live
        });
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A thread-safe fixed-window limiter backed by a bounded bucket table.
pub struct LocalRateLimiter {
    table: Mutex<BucketTable>,
    max_buckets: AtomicUsize,
}

impl LocalRateLimiter {
    /// Create a limiter with the default capacity.
    pub fn new() -> Self {
        Self::with_max_buckets(DEFAULT_MAX_BUCKETS)
    }

    /// Create a limiter tracking at most `max_buckets` keys.
    pub fn with_max_buckets(max_buckets: usize) -> Self {
        Self {
            table: Mutex::new(BucketTable::default()),
            max_buckets: AtomicUsize::new(max_buckets.max(1)),
        }
    }

    /// Change the capacity bound. A lower bound takes effect on the next write.
    pub fn set_max_buckets(&self, max_buckets: usize) {
        self.max_buckets.store(max_buckets.max(1), Ordering::Relaxed);
    }

    pub fn max_buckets(&self) -> usize {
        self.max_buckets.load(Ordering::Relaxed)
    }

    /// Count one hit for `key` against `limit` per `window_ms`.
    pub fn check(&self, key: &str, limit: u32, window_ms: u32) -> RateDecision {
        self.check_at(key, limit, window_ms, now_ms())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(&self, key: &str, limit: u32, window_ms: u32, now: u64) -> RateDecision {
        let mut table = self.table.lock();

        if now.saturating_sub(table.last_prune_ms) >= PRUNE_INTERVAL_MS {
            let pruned = table.prune_expired(now);
            table.last_prune_ms = now;
            if pruned > 0 {
                debug!(pruned = pruned, remaining = table.len(), "Pruned expired buckets");
            }
        }

        let bucket = match table.get(key) {
            Some(existing) if existing.reset_at_ms > now => CounterBucket {
                count: existing.count.saturating_add(1),
                reset_at_ms: existing.reset_at_ms,
                last_seen_ms: now,
            },
            _ => CounterBucket {
                count: 1,
                reset_at_ms: now + u64::from(window_ms),
                last_seen_ms: now,
            },
        };
        table.put(key, bucket);

        let max = self.max_buckets();
        while table.len() > max {
            if let Some(evicted) = table.evict_oldest() {
                debug!(key = %evicted, max_buckets = max, "Evicted bucket over capacity");
            }
        }

        trace!(key = %key, count = bucket.count, limit = limit, "Local rate limit check");

        RateDecision::from_window_count(limit, bucket.count, bucket.reset_at_ms, now)
    }

    /// Snapshot of the bucket for `key`, if tracked.
    pub fn bucket(&self, key: &str) -> Option<CounterBucket> {
        self.table.lock().get(key)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all buckets.
    pub fn clear(&self) {
        let mut table = self.table.lock();
        table.entries.clear();
        table.order.clear();
    }
}

impl Default for LocalRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterBackend for LocalRateLimiter {
    async fn check(&self, key: &str, limit: u32, window_ms: u32) -> RateDecision {
        LocalRateLimiter::check(self, key, limit, window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn test_first_limit_calls_allowed_then_rejected() {
        let limiter = LocalRateLimiter::new();

        for i in 1..=5 {
            let decision = limiter.check_at("k", 5, 60_000, T0 + i);
            assert!(decision.allowed, "call {} should be allowed", i);
            assert_eq!(decision.remaining, 5 - i as u32);
        }

        let decision = limiter.check_at("k", 5, 60_000, T0 + 6);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.retry_after_secs >= 1);
    }

    #[test]
    fn test_three_calls_with_limit_two() {
        let limiter = LocalRateLimiter::new();
        let key = "t1:1.2.3.4:/x";

        let decisions: Vec<RateDecision> = (0..3)
            .map(|i| limiter.check_at(key, 2, 60_000, T0 + i))
            .collect();
        let allowed: Vec<bool> = decisions.iter().map(|d| d.allowed).collect();
        assert_eq!(allowed, vec![true, true, false]);
        assert!(decisions[2].retry_after_secs >= 1);
    }

    #[test]
    fn test_window_rolls_over_without_carry() {
        let limiter = LocalRateLimiter::new();

        limiter.check_at("k", 1, 1_000, T0);
        assert!(!limiter.check_at("k", 1, 1_000, T0 + 10).allowed);

        let after = limiter.check_at("k", 1, 1_000, T0 + 1_000);
        assert!(after.allowed);
        assert_eq!(limiter.bucket("k").unwrap().count, 1);
        assert_eq!(after.reset_at_ms, T0 + 2_000);
    }

    #[test]
    fn test_fresh_window_with_zero_limit_is_allowed() {
        let limiter = LocalRateLimiter::new();
        let decision = limiter.check_at("k", 0, 1_000, T0);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(!limiter.check_at("k", 0, 1_000, T0 + 1).allowed);
    }

    #[test]
    fn test_remaining_never_negative() {
        let limiter = LocalRateLimiter::new();
        for i in 0..20 {
            let decision = limiter.check_at("k", 3, 60_000, T0 + i);
            let count = i as u32 + 1;
            assert_eq!(decision.remaining, 3u32.saturating_sub(count));
        }
    }

    #[test]
    fn test_table_bounded_and_evicts_oldest() {
        let limiter = LocalRateLimiter::with_max_buckets(3);

        for key in ["a", "b", "c"] {
            limiter.check_at(key, 10, 60_000, T0);
        }
        // Touching "a" moves it behind "b" and "c".
        limiter.check_at("a", 10, 60_000, T0 + 1);
        limiter.check_at("d", 10, 60_000, T0 + 2);

        assert_eq!(limiter.len(), 3);
        assert!(limiter.bucket("b").is_none());
        assert!(limiter.bucket("a").is_some());
        assert!(limiter.bucket("c").is_some());
        assert!(limiter.bucket("d").is_some());

        for i in 0..100 {
            limiter.check_at(&format!("burst-{}", i), 10, 60_000, T0 + 3);
            assert!(limiter.len() <= 3);
        }
    }

    #[test]
    fn test_lowering_bound_trims_on_next_write() {
        let limiter = LocalRateLimiter::with_max_buckets(10);
        for i in 0..10 {
            limiter.check_at(&format!("k{}", i), 10, 60_000, T0 + i);
        }
        assert_eq!(limiter.len(), 10);

        limiter.set_max_buckets(4);
        limiter.check_at("new", 10, 60_000, T0 + 20);

        assert_eq!(limiter.len(), 4);
        for survivor in ["k7", "k8", "k9", "new"] {
            assert!(limiter.bucket(survivor).is_some(), "{} should survive", survivor);
        }
    }

    #[test]
    fn test_pruning_is_throttled() {
        let limiter = LocalRateLimiter::new();

        // First call prunes (nothing yet) and starts the throttle.
        limiter.check_at("short", 10, 1_000, T0);
        limiter.check_at("long", 10, 120_000, T0);

        // "short" has expired but the throttle interval has not passed.
        limiter.check_at("other", 10, 120_000, T0 + 5_000);
        assert!(limiter.bucket("short").is_some());

        limiter.check_at("other", 10, 120_000, T0 + PRUNE_INTERVAL_MS);
        assert!(limiter.bucket("short").is_none());
        assert!(limiter.bucket("long").is_some());
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_concurrent_checks_do_not_lose_updates() {
        let limiter = std::sync::Arc::new(LocalRateLimiter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        limiter.check("shared", 10_000, 60_000);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(limiter.bucket("shared").unwrap().count, 800);
    }

    #[test]
    fn test_clear() {
        let limiter = LocalRateLimiter::new();
        limiter.check_at("k", 1, 1_000, T0);
        assert!(!limiter.is_empty());
        limiter.clear();
        assert!(limiter.is_empty());
    }

    #[tokio::test]
    async fn test_backend_trait_dispatch() {
        let limiter: std::sync::Arc<dyn RateLimiterBackend> =
            std::sync::Arc::new(LocalRateLimiter::new());
        assert!(limiter.check("k", 1, 60_000).await.allowed);
        assert!(!limiter.check("k", 1, 60_000).await.allowed);
    }
}
