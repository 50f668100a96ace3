//! Shared process state and router assembly. Mirrors the teacher crate's
//! `main.rs`, which builds one `Config` + `reqwest::Client` pair and wires
//! them into the router via `with_state`; this generalizes that single
//! struct to the gateway's four collaborators.

use crate::admin;
use crate::auth;
use crate::config::ConfigStore;
use crate::error::GatewayError;
use crate::forwarding;
use crate::health::HealthTracker;
use crate::trace::TraceRecorder;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub struct AppState {
    pub config: ConfigStore,
    pub health: HealthTracker,
    pub trace: TraceRecorder,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: ConfigStore, log_dir: impl Into<std::path::PathBuf>) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            health: HealthTracker::new(),
            trace: TraceRecorder::new(log_dir)?,
            http: reqwest::Client::new(),
        })
    }
}

pub struct RouterOptions {
    pub cors_enabled: bool,
    pub static_dir: Option<std::path::PathBuf>,
}

pub fn build_router(state: Arc<AppState>, opts: RouterOptions) -> Router {
    let gateway_routes = Router::new()
        .route("/v1/chat/completions", post(forwarding::chat_completions))
        .route("/v1/messages", post(forwarding::messages))
        .route("/v1/models", get(admin::list_models_public))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth::require_bearer));

    let admin_routes = Router::new()
        .route("/admin/api/providers", get(admin::list_providers).post(admin::upsert_provider))
        .route("/admin/api/providers/{name}", delete(admin::delete_provider))
        .route("/admin/api/groups", get(admin::list_groups).post(admin::upsert_group))
        .route("/admin/api/groups/{name}", delete(admin::delete_group))
        .route("/admin/api/keys", get(admin::list_keys).post(admin::create_key))
        .route("/admin/api/keys/{id}", delete(admin::delete_key))
        .route("/admin/api/stats", get(admin::stats))
        .route("/admin/api/health", get(admin::health_status))
        .route("/admin/api/health/{name}/reset", post(admin::reset_health))
        .route("/admin/api/health/reset", post(admin::reset_all_health))
        .route("/admin/api/logs", get(admin::query_logs).delete(admin::clear_logs))
        .route("/admin/api/models", get(admin::probe_models));

    let ping_route = Router::new().route("/admin/api/ping", get(admin::ping));
    let authenticated_admin = admin_routes
        .route_layer(axum::middleware::from_fn(auth::require_basic_admin));

    let mut router = Router::new()
        .merge(gateway_routes)
        .merge(ping_route)
        .merge(authenticated_admin)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(catch_panic))
        .fallback(fallback);

    if opts.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }

    if let Some(dir) = opts.static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router.with_state(state)
}

async fn fallback() -> impl IntoResponse {
    GatewayError::Internal("no handler for this route".to_string()).into_response()
}

fn catch_panic(err: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    let message = if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %message, "request handler panicked");
    (StatusCode::SERVICE_UNAVAILABLE, "internal error").into_response()
}
