//! HTTP integration: the admission checkpoint middleware and its server.

mod checkpoint;
mod server;

pub use checkpoint::{
    admission_checkpoint, apply_rate_limit_headers, client_ip, AdmissionCheckpoint, QuotaExceeded,
    RequestIdentity, TenantId, PUBLIC_TENANT, QUOTA_WINDOW_MS, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::HttpServer;
