//! Rate limiting logic and state management.

mod backend;
mod decision;
mod distributed;
mod local;
mod quota;

pub use backend::RateLimiterBackend;
pub use decision::{now_ms, RateDecision};
pub use distributed::DistributedRateLimiter;
pub use local::{CounterBucket, LocalRateLimiter, DEFAULT_MAX_BUCKETS, PRUNE_INTERVAL_MS};
pub use quota::{
    OverrideSnapshot, OverrideSource, PlanTier, QuotaResolver, QuotaSettings, StaticOverrides,
    StaticPlanLookup, TenantPlan, TenantPlanLookup, OVERRIDE_REFRESH_MS, TENANT_CACHE_TTL_MS,
};
