//! HTTP server implementation using Axum.

use axum::response::IntoResponse;
use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use nudge_core::config::GatewayConfig;
use nudge_scheduler::{CampaignDb, Reconciler, Shutdown};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    pub start_time: std::time::Instant,
    /// Required in `X-Admin-Token` on every `/api` route when set.
    pub admin_token: Option<String>,
    pub reconciler: Arc<Reconciler>,
    /// Backing database, for audit rows and content edits.
    pub db: CampaignDb,
    /// Passes started from the gateway stop with the process.
    pub shutdown: Shutdown,
}

impl AppState {
    pub fn new(
        gateway_config: GatewayConfig,
        reconciler: Arc<Reconciler>,
        db: CampaignDb,
        shutdown: Shutdown,
    ) -> Self {
        let admin_token = gateway_config
            .admin_token
            .clone()
            .filter(|t| !t.trim().is_empty());
        Self {
            gateway_config,
            start_time: std::time::Instant::now(),
            admin_token,
            reconciler,
            db,
            shutdown,
        }
    }
}

/// Admin token middleware: validates the X-Admin-Token header.
async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    // If no token configured, allow all
    let Some(expected) = &state.admin_token else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get("X-Admin-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided == expected {
        return next.run(req).await;
    }

    (
        axum::http::StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"ok": false, "error": "Unauthorized: invalid or missing admin token"})),
    )
        .into_response()
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    // Protected routes: require valid admin token
    let protected = Router::new()
        .route("/api/v1/status", get(super::routes::status))
        .route("/api/v1/recipients", get(super::routes::list_recipients))
        .route("/api/v1/events", get(super::routes::list_events))
        .route("/api/v1/responses", get(super::routes::list_responses))
        .route("/api/v1/enroll", post(super::routes::enroll))
        .route("/api/v1/blast", post(super::routes::blast))
        .route("/api/v1/completions", post(super::routes::complete))
        .route("/api/v1/rebase", post(super::routes::rebase))
        .route("/api/v1/content", post(super::routes::set_content))
        .route("/api/v1/content/reload", post(super::routes::reload_content))
        .route("/api/v1/test-send", post(super::routes::test_send))
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_admin,
        ));

    // Public routes: no auth
    let public = Router::new().route("/health", get(super::routes::health_check));

    protected
        .merge(public)
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: NUDGE_CORS_ORIGINS=https://admin.example.com
            if let Ok(origins_str) = std::env::var("NUDGE_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Serve until shutdown is requested.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = format!(
        "{}:{}",
        state.gateway_config.host, state.gateway_config.port
    );
    if state.admin_token.is_none() {
        tracing::warn!("⚠️ Gateway has no admin token; every route is open");
    }
    let mut shutdown = state.shutdown.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    tracing::info!("🌐 Gateway stopped");
    Ok(())
}
