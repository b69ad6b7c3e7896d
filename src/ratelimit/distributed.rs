//! Distributed rate limiter backed by the remote counter store.
//!
//! Every check first tries the remote increment so all service instances
//! share one counter per key. Any remote failure degrades that check to the
//! in-process limiter; the caller always gets a decision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use super::backend::RateLimiterBackend;
use super::decision::{now_ms, RateDecision};
use super::local::LocalRateLimiter;
use crate::store::{CounterClient, StoreConfig, StoreError};

/// Rate limiter that shares counters through the remote store when possible.
pub struct DistributedRateLimiter {
    /// Remote client, `None` in local-only mode.
    client: Option<CounterClient>,
    /// Fallback and local-only counter.
    local: Arc<LocalRateLimiter>,
    /// Set on the first remote failure and never cleared, so an extended
    /// outage produces one warning rather than one per request.
    remote_failure_logged: AtomicBool,
}

impl DistributedRateLimiter {
    /// Create a limiter from an optional remote client.
    pub fn new(client: Option<CounterClient>, local: Arc<LocalRateLimiter>) -> Self {
        Self {
            client,
            local,
            remote_failure_logged: AtomicBool::new(false),
        }
    }

    /// Create a limiter that never contacts a remote store.
    pub fn local_only(local: Arc<LocalRateLimiter>) -> Self {
        Self::new(None, local)
    }

    /// Create a limiter from an optional connection URL.
    ///
    /// A missing URL selects local-only mode. An invalid URL is logged and
    /// also selects local-only mode.
    pub fn from_url(url: Option<&str>, timeout: Duration, local: Arc<LocalRateLimiter>) -> Self {
        let client = match url.map(str::trim).filter(|u| !u.is_empty()) {
            None => {
                info!("No remote store configured, using local rate limiting only");
                None
            }
            Some(url) => match StoreConfig::parse(url) {
                Ok(config) => {
                    info!(
                        host = %config.host,
                        port = config.port,
                        database = config.database,
                        auth = config.password.is_some(),
                        "Using remote store for distributed rate limiting"
                    );
                    Some(CounterClient::new(config).with_timeout(timeout))
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        "Ignoring invalid remote store url, using local rate limiting only"
                    );
                    None
                }
            },
        };
        Self::new(client, local)
    }

    /// Whether a remote store is configured.
    pub fn is_distributed(&self) -> bool {
        self.client.is_some()
    }

    /// The fallback limiter.
    pub fn local(&self) -> &Arc<LocalRateLimiter> {
        &self.local
    }

    /// Whether a remote failure has been reported.
    pub fn remote_failure_logged(&self) -> bool {
        self.remote_failure_logged.load(Ordering::Relaxed)
    }

    /// Count one hit for `key`, preferring the shared remote counter.
    pub async fn check(&self, key: &str, limit: u32, window_ms: u32) -> RateDecision {
        let Some(client) = &self.client else {
            return self.local.check(key, limit, window_ms);
        };

        match client.increment(key, window_ms).await {
            Ok(reply) => {
                let now = now_ms();
                let reset_at_ms = now + u64::from(reply.ttl_remaining_ms);
                let decision =
                    RateDecision::from_window_count(limit, reply.count, reset_at_ms, now);

                trace!(
                    key = %key,
                    count = reply.count,
                    limit = limit,
                    "Distributed rate limit check"
                );
                if !decision.allowed {
                    debug!(
                        key = %key,
                        count = reply.count,
                        limit = limit,
                        "Distributed rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => {
                self.report_remote_failure(&e);
                self.local.check(key, limit, window_ms)
            }
        }
    }

    fn report_remote_failure(&self, error: &StoreError) {
        if !self.remote_failure_logged.swap(true, Ordering::Relaxed) {
            warn!(
                error = %error,
                kind = error.kind(),
                "Remote rate limit store failed, falling back to local counters"
            );
        }
    }
}

#[async_trait]
impl RateLimiterBackend for DistributedRateLimiter {
    async fn check(&self, key: &str, limit: u32, window_ms: u32) -> RateDecision {
        DistributedRateLimiter::check(self, key, limit, window_ms).await
    }
}
