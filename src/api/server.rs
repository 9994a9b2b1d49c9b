//! HTTP server setup and configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use reqwest::Client;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::handlers;
use crate::config::Config;
use crate::router::Router as TaskRouter;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<TaskRouter>,
    pub http_client: Client,
    /// Source of `POST /admin/reload`; reload is refused when unset.
    pub config_path: Option<Arc<PathBuf>>,
}

/// Correlation id assigned to every inbound request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

async fn assign_request_id(mut request: Request, next: Next) -> Response {
    request.extensions_mut().insert(RequestId(Uuid::new_v4()));
    next.run(request).await
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Task submission
        .route("/v1/route", post(handlers::route))
        .route("/v1/route/preview", post(handlers::preview))
        // Observability
        .route("/v1/status", get(handlers::status))
        .route("/health", get(handlers::health))
        .route("/providers", get(handlers::list_providers))
        // Admin
        .route("/admin/reset", post(handlers::admin_reset))
        .route("/admin/reload", post(handlers::admin_reload))
        // State and middleware
        .with_state(state)
        .layer(middleware::from_fn(assign_request_id))
        .layer(TraceLayer::new_for_http())
}

/// Shared HTTP client for every provider.
pub fn build_http_client() -> reqwest::Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(120))
        .connect_timeout(Duration::from_secs(10))
        .build()
}

/// Run the HTTP server until Ctrl-C.
pub async fn run_server(config: Config, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();
    let http_client = build_http_client()?;

    let router = Arc::new(TaskRouter::from_config(&config, http_client.clone()));
    let prober = router.spawn_prober(config.health.probe_interval());

    let state = AppState {
        router,
        http_client,
        config_path: config_path.map(Arc::new),
    };

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting airoute server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    prober.shutdown().await;
    tracing::info!("airoute server stopped");

    Ok(())
}
