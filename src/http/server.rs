//! HTTP server hosting the admission checkpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::checkpoint::{admission_checkpoint, AdmissionCheckpoint};
use crate::error::{Result, TollgateError};

/// HTTP server that puts every application route behind the checkpoint.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The checkpoint instance
    checkpoint: Arc<AdmissionCheckpoint>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, checkpoint: Arc<AdmissionCheckpoint>) -> Self {
        Self { addr, checkpoint }
    }

    /// Wrap `app` with the checkpoint and add an unthrottled `/healthz`.
    pub fn router(&self, app: Router) -> Router {
        app.layer(axum::middleware::from_fn_with_state(
            self.checkpoint.clone(),
            admission_checkpoint,
        ))
        .route("/healthz", get(|| async { "ok" }))
    }

    /// Serve `app` until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, app: Router, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.router(app);
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server with admission checkpoint");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{
        LocalRateLimiter, QuotaResolver, QuotaSettings, StaticOverrides, StaticPlanLookup,
    };
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn server() -> HttpServer {
        let quotas = QuotaResolver::new(
            QuotaSettings {
                public_limit: 1,
                paid_limit: 1,
                default_limit: 1,
            },
            Arc::new(StaticPlanLookup::new()),
            Box::new(StaticOverrides(None)),
        );
        let checkpoint =
            AdmissionCheckpoint::new(Arc::new(LocalRateLimiter::new()), Arc::new(quotas));
        HttpServer::new("127.0.0.1:0".parse().unwrap(), Arc::new(checkpoint))
    }

    fn get_req(path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header("X-Forwarded-For", "198.51.100.4")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_healthz_is_not_rate_limited() {
        let router = server().router(Router::new());
        for _ in 0..5 {
            let response = router.clone().oneshot(get_req("/healthz")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_app_routes_are_rate_limited() {
        let router = server().router(Router::new().route("/api", get(|| async { "hi" })));

        let first = router.clone().oneshot(get_req("/api")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = router.clone().oneshot(get_req("/api")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_serve_with_immediate_shutdown() {
        let result = server().serve_with_shutdown(Router::new(), async {}).await;
        assert!(result.is_ok());
    }
}
