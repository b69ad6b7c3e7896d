//! Rate limiter trait for abstracting local and distributed implementations.

use async_trait::async_trait;

use super::decision::RateDecision;

/// Trait for rate limiter implementations.
///
/// Implemented by both [`LocalRateLimiter`](super::LocalRateLimiter) and
/// [`DistributedRateLimiter`](super::DistributedRateLimiter) so the admission
/// checkpoint can work with either.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Count one hit for `key` against `limit` per `window_ms` milliseconds.
    ///
    /// Never fails; backends absorb their own errors.
    async fn check(&self, key: &str, limit: u32, window_ms: u32) -> RateDecision;
}
