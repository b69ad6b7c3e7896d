use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::Router;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::http::{AdmissionCheckpoint, HttpServer};
use tollgate::ratelimit::{
    DistributedRateLimiter, LocalRateLimiter, QuotaResolver, QuotaSettings, StaticOverrides,
    StaticPlanLookup,
};

/// Admission control and rate limiting service.
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// YAML configuration file; TOLLGATE_* environment variables are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => TollgateConfig::from_file(path)?,
        None => TollgateConfig::from_env()?,
    };
    let rl = &config.rate_limiting;
    info!(
        listen_addr = %config.server.listen_addr,
        public_limit = rl.public_limit_per_minute,
        paid_limit = rl.paid_limit_per_minute,
        default_limit = rl.default_limit_per_minute,
        local_max_buckets = rl.local_max_buckets,
        "Configuration loaded"
    );

    let local = Arc::new(LocalRateLimiter::with_max_buckets(rl.local_max_buckets));
    let limiter =
        DistributedRateLimiter::from_url(rl.store_url.as_deref(), rl.store_timeout(), local);

    // Tenant plans live in the host application's store; standalone, every
    // tenant gets the default quota unless overridden.
    let quotas = QuotaResolver::new(
        QuotaSettings::from(rl),
        Arc::new(StaticPlanLookup::new()),
        Box::new(StaticOverrides(rl.tenant_overrides.clone())),
    );

    let checkpoint = Arc::new(AdmissionCheckpoint::new(Arc::new(limiter), Arc::new(quotas)));
    let server = HttpServer::new(config.server.listen_addr, checkpoint);

    let app = Router::new().fallback(|| async { (StatusCode::OK, "admitted") });
    server.serve_with_shutdown(app, shutdown_signal()).await?;

    info!("Tollgate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
