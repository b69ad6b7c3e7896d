//! Tenant quota resolution.
//!
//! A tenant's per-minute quota comes from, in order of precedence:
//!
//! 1. an operator override (`tenantId:limit,...`), rebuilt at most every
//!    [`OVERRIDE_REFRESH_MS`] and shared as one versioned snapshot;
//! 2. the public quota, for anonymous traffic;
//! 3. the tenant's billing plan, looked up through [`TenantPlanLookup`] and
//!    cached per tenant for [`TENANT_CACHE_TTL_MS`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::decision::now_ms;
use crate::config::RateLimitingConfig;
use crate::error::Result;

/// How long a resolved tenant quota is reused.
pub const TENANT_CACHE_TTL_MS: u64 = 60_000;
/// Minimum time between two rebuilds of the override snapshot.
pub const OVERRIDE_REFRESH_MS: u64 = 30_000;
/// Above this many cached tenants, expired entries are swept on insert,
/// at most once per [`TENANT_CACHE_TTL_MS`].
const TENANT_CACHE_SWEEP_THRESHOLD: usize = 10_000;

/// Billing tier of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Paid,
}

/// What the billing store knows about a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPlan {
    pub tier: PlanTier,
    /// Whether the subscription is in good standing.
    pub active: bool,
}

impl TenantPlan {
    pub fn is_active_paid(&self) -> bool {
        self.tier == PlanTier::Paid && self.active
    }
}

/// Looks up a tenant's billing plan in the host application's store.
#[async_trait]
pub trait TenantPlanLookup: Send + Sync {
    /// `Ok(None)` for tenants the store does not know.
    async fn plan_for(&self, tenant_id: &str) -> Result<Option<TenantPlan>>;
}

/// An in-memory plan table.
#[derive(Debug, Default)]
pub struct StaticPlanLookup {
    plans: HashMap<String, TenantPlan>,
    lookups: AtomicUsize,
}

impl StaticPlanLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, tenant_id: &str, plan: TenantPlan) -> Self {
        self.plans.insert(tenant_id.to_string(), plan);
        self
    }

    /// Number of lookups served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TenantPlanLookup for StaticPlanLookup {
    async fn plan_for(&self, tenant_id: &str) -> Result<Option<TenantPlan>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.plans.get(tenant_id).cloned())
    }
}

/// Supplies the flat override string, e.g. `"tenant-a:500,tenant-b:50"`.
pub trait OverrideSource: Send + Sync {
    fn load(&self) -> Option<String>;
}

/// A fixed override string.
#[derive(Debug, Clone, Default)]
pub struct StaticOverrides(pub Option<String>);

impl OverrideSource for StaticOverrides {
    fn load(&self) -> Option<String> {
        self.0.clone()
    }
}

impl<F> OverrideSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn load(&self) -> Option<String> {
        self()
    }
}

/// One parsed generation of the override table.
#[derive(Debug, Clone, Default)]
pub struct OverrideSnapshot {
    /// 0 until the first build.
    pub version: u64,
    pub built_at_ms: u64,
    limits: HashMap<String, u32>,
}

impl OverrideSnapshot {
    /// Parse `tenantId:limit` pairs separated by commas.
    ///
    /// Malformed entries are skipped; the rest still apply.
    pub fn parse(raw: &str) -> HashMap<String, u32> {
        let mut limits = HashMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((tenant, limit)) = entry.rsplit_once(':') else {
                debug!(entry = %entry, "Skipping override without a limit");
                continue;
            };
            let tenant = tenant.trim();
            if tenant.is_empty() {
                debug!(entry = %entry, "Skipping override without a tenant id");
                continue;
            }
            match limit.trim().parse::<u32>() {
                Ok(limit) => {
                    limits.insert(tenant.to_string(), limit);
                }
                Err(_) => debug!(entry = %entry, "Skipping override with unparsable limit"),
            }
        }
        limits
    }

    pub fn get(&self, tenant_id: &str) -> Option<u32> {
        self.limits.get(tenant_id).copied()
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct TenantQuotaCacheEntry {
    limit: u32,
    expires_at_ms: u64,
}

/// The quota numbers the resolver hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSettings {
    /// Anonymous traffic.
    pub public_limit: u32,
    /// Tenants on an active paid plan.
    pub paid_limit: u32,
    /// Every other tenant.
    pub default_limit: u32,
}

impl From<&RateLimitingConfig> for QuotaSettings {
    fn from(config: &RateLimitingConfig) -> Self {
        Self {
            public_limit: config.public_limit_per_minute,
            paid_limit: config.paid_limit_per_minute,
            default_limit: config.default_limit_per_minute,
        }
    }
}

/// Maps a tenant (or anonymous traffic) to its per-minute quota.
pub struct QuotaResolver {
    settings: QuotaSettings,
    plans: Arc<dyn TenantPlanLookup>,
    override_source: Box<dyn OverrideSource>,
    overrides: RwLock<Arc<OverrideSnapshot>>,
    tenant_cache: DashMap<String, TenantQuotaCacheEntry>,
    last_cache_sweep_ms: AtomicU64,
}

impl QuotaResolver {
    pub fn new(
        settings: QuotaSettings,
        plans: Arc<dyn TenantPlanLookup>,
        override_source: Box<dyn OverrideSource>,
    ) -> Self {
        Self {
            settings,
            plans,
            override_source,
            overrides: RwLock::new(Arc::new(OverrideSnapshot::default())),
            tenant_cache: DashMap::new(),
            last_cache_sweep_ms: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> QuotaSettings {
        self.settings
    }

    /// Resolve the quota for `tenant_id`, `None` meaning anonymous.
    pub async fn resolve(&self, tenant_id: Option<&str>) -> u32 {
        self.resolve_at(tenant_id, now_ms()).await
    }

    /// Same as [`resolve`](Self::resolve) with an explicit clock reading.
    pub async fn resolve_at(&self, tenant_id: Option<&str>, now: u64) -> u32 {
        let Some(tenant_id) = tenant_id else {
            return self.settings.public_limit;
        };

        if let Some(limit) = self.overrides_at(now).get(tenant_id) {
            return limit;
        }

        let cached = self.tenant_cache.get(tenant_id).map(|entry| *entry);
        if let Some(entry) = cached {
            if entry.expires_at_ms > now {
                return entry.limit;
            }
        }

        let limit = match self.plans.plan_for(tenant_id).await {
            Ok(plan) => {
                let limit = match plan {
                    Some(plan) if plan.is_active_paid() => self.settings.paid_limit,
                    _ => self.settings.default_limit,
                };
                self.cache_tenant(tenant_id, limit, now);
                limit
            }
            Err(e) => {
                // Not cached, so the next request retries the lookup.
                warn!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "Tenant plan lookup failed, using default quota"
                );
                self.settings.default_limit
            }
        };

        debug!(tenant_id = %tenant_id, limit = limit, "Resolved tenant quota");
        limit
    }

    /// The current override snapshot, rebuilt if it is older than
    /// [`OVERRIDE_REFRESH_MS`].
    pub fn overrides_at(&self, now: u64) -> Arc<OverrideSnapshot> {
        let fresh = |snapshot: &OverrideSnapshot| {
            snapshot.version > 0 && now.saturating_sub(snapshot.built_at_ms) < OVERRIDE_REFRESH_MS
        };

        {
            let current = self.overrides.read();
            if fresh(&**current) {
                return current.clone();
            }
        }

        let mut current = self.overrides.write();
        // Another caller may have rebuilt it while we waited for the lock.
        if fresh(&**current) {
            return current.clone();
        }

        let limits = self
            .override_source
            .load()
            .map(|raw| OverrideSnapshot::parse(&raw))
            .unwrap_or_default();
        let snapshot = Arc::new(OverrideSnapshot {
            version: current.version + 1,
            built_at_ms: now,
            limits,
        });

        if snapshot.len() != current.len() {
            info!(
                version = snapshot.version,
                overrides = snapshot.len(),
                "Rebuilt tenant quota overrides"
            );
        }
        *current = snapshot.clone();
        snapshot
    }

    fn cache_tenant(&self, tenant_id: &str, limit: u32, now: u64) {
        self.sweep_tenant_cache(now);
        self.tenant_cache.insert(
            tenant_id.to_string(),
            TenantQuotaCacheEntry {
                limit,
                expires_at_ms: now + TENANT_CACHE_TTL_MS,
            },
        );
    }

    /// Drop expired tenant entries once the cache is large. Returns whether
    /// a sweep ran.
    fn sweep_tenant_cache(&self, now: u64) -> bool {
        if self.tenant_cache.len() < TENANT_CACHE_SWEEP_THRESHOLD {
            return false;
        }
        let last = self.last_cache_sweep_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < TENANT_CACHE_TTL_MS {
            return false;
        }
        // Only one caller wins the sweep for this interval.
        if self
            .last_cache_sweep_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        let before = self.tenant_cache.len();
        self.tenant_cache.retain(|_, entry| entry.expires_at_ms > now);
        debug!(
            swept = before - self.tenant_cache.len(),
            remaining = self.tenant_cache.len(),
            "Swept expired tenant quotas"
        );
        true
    }
}
