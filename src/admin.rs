//! Admin CRUD surface: providers, groups, keys, aggregate stats, health
//! introspection, log query, and the upstream model-list probe. Every
//! handler here sits behind the `require_basic_admin` middleware installed
//! in `app::build_router`, except `ping` and the public `/v1/models` list.

use crate::app::AppState;
use crate::config::{AccessKey, Group, Provider};
use crate::error::GatewayError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub async fn ping() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// -- providers ----------------------------------------------------------

pub async fn list_providers(State(state): State<Arc<AppState>>) -> Json<Vec<Provider>> {
    Json(state.config.list_providers())
}

pub async fn upsert_provider(
    State(state): State<Arc<AppState>>,
    Json(provider): Json<Provider>,
) -> Result<Json<Provider>, GatewayError> {
    state.config.upsert_provider(provider.clone())?;
    Ok(Json(provider))
}

pub async fn delete_provider(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Result<StatusCode, GatewayError> {
    let removed = state.config.delete_provider(&name)?;
    Ok(if removed { StatusCode::NO_CONTENT } else { StatusCode::NOT_FOUND })
}

// -- groups ---------------------------------------------------------------

pub async fn list_groups(State(state): State<Arc<AppState>>) -> Json<Vec<Group>> {
    Json(state.config.list_groups())
}

pub async fn upsert_group(State(state): State<Arc<AppState>>, Json(group): Json<Group>) -> Result<Json<Group>, GatewayError> {
    state.config.upsert_group(group.clone())?;
    Ok(Json(group))
}

pub async fn delete_group(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Result<StatusCode, GatewayError> {
    let removed = state.config.delete_group(&name)?;
    Ok(if removed { StatusCode::NO_CONTENT } else { StatusCode::NOT_FOUND })
}

// -- access keys ------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    name: String,
    #[serde(default)]
    token: Option<String>,
}

pub async fn list_keys(State(state): State<Arc<AppState>>) -> Json<Vec<AccessKey>> {
    Json(state.config.list_keys())
}

pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateKeyRequest>,
) -> Result<Json<AccessKey>, GatewayError> {
    let key = state.config.create_key(req.name, req.token)?;
    Ok(Json(key))
}

pub async fn delete_key(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<StatusCode, GatewayError> {
    let removed = state.config.delete_key(&id)?;
    Ok(if removed { StatusCode::NO_CONTENT } else { StatusCode::NOT_FOUND })
}

// -- aggregate stats / health -------------------------------------------------

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<HashMap<String, crate::config::ProviderStats>> {
    Json(state.config.stats_snapshot())
}

#[derive(Serialize)]
pub struct ProviderHealthView {
    provider: String,
    base: f64,
    current: f64,
    ratio: f64,
    recent_error_count: usize,
    last_error: Option<u16>,
    total_failures: u64,
    window_ms: u64,
}

const HEALTH_VIEW_BASE: f64 = 1000.0;

pub async fn health_status(State(state): State<Arc<AppState>>) -> Json<Vec<ProviderHealthView>> {
    let stats = state.config.stats_snapshot();
    let views = state
        .config
        .list_providers()
        .into_iter()
        .map(|p| {
            let current = state.health.weight(&p.name, HEALTH_VIEW_BASE);
            let h = state.health.stats(&p.name);
            ProviderHealthView {
                total_failures: stats.get(&p.name).map(|s| s.failures).unwrap_or(0),
                provider: p.name,
                base: HEALTH_VIEW_BASE,
                current,
                ratio: current / HEALTH_VIEW_BASE,
                recent_error_count: h.recent_error_count,
                last_error: h.last_status,
                window_ms: h.window.as_millis() as u64,
            }
        })
        .collect();
    Json(views)
}

pub async fn reset_health(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> StatusCode {
    state.health.reset(&name);
    StatusCode::NO_CONTENT
}

pub async fn reset_all_health(State(state): State<Arc<AppState>>) -> StatusCode {
    state.health.reset_all();
    StatusCode::NO_CONTENT
}

// -- log query / clear ---------------------------------------------------

#[derive(Deserialize)]
pub struct LogQuery {
    date: Option<String>,
    keyword: Option<String>,
    #[serde(default)]
    errors_only: bool,
    #[serde(default)]
    start_index: usize,
    #[serde(default = "default_limit")]
    limit: usize,
    /// When set, ignores `start_index` and returns the newest `limit`
    /// entries newest-first — the dashboard's "pull latest" mode.
    #[serde(default)]
    refresh: bool,
}

fn default_limit() -> usize {
    50
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQueryResponse {
    logs: Vec<serde_json::Value>,
    has_more: bool,
    total: usize,
    loaded: usize,
    filtered: usize,
}

pub async fn query_logs(State(state): State<Arc<AppState>>, Query(q): Query<LogQuery>) -> Result<Json<LogQueryResponse>, GatewayError> {
    let date = q
        .date
        .as_deref()
        .map(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d"))
        .transpose()
        .map_err(|e| GatewayError::Internal(format!("invalid date: {e}")))?;

    let start_index = if q.refresh { 0 } else { q.start_index };
    let result = state.trace.query(date, q.keyword.as_deref(), q.errors_only, start_index, q.limit);

    Ok(Json(LogQueryResponse {
        loaded: result.logs.len(),
        has_more: start_index > 0,
        logs: result.logs,
        total: result.total,
        filtered: result.filtered,
    }))
}

#[derive(Deserialize, Default)]
pub struct ClearLogsQuery {
    #[serde(default)]
    all: bool,
}

pub async fn clear_logs(State(state): State<Arc<AppState>>, Query(q): Query<ClearLogsQuery>) -> Result<StatusCode, GatewayError> {
    state.trace.clear(q.all).map_err(|e| GatewayError::Internal(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

// -- model probe / public model list --------------------------------------

pub async fn list_models_public(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let created = chrono::Utc::now().timestamp_millis();
    let data: Vec<_> = state
        .config
        .list_groups()
        .into_iter()
        .map(|g| serde_json::json!({ "id": g.name, "object": "model", "created": created, "owned_by": "gateway" }))
        .collect();
    Json(serde_json::json!({ "object": "list", "data": data }))
}

#[derive(Deserialize)]
pub struct ProbeQuery {
    provider: String,
}

pub async fn probe_models(State(state): State<Arc<AppState>>, Query(q): Query<ProbeQuery>) -> Result<Json<serde_json::Value>, GatewayError> {
    let provider = state
        .config
        .get_provider(&q.provider)
        .ok_or_else(|| GatewayError::Internal(format!("unknown provider \"{}\"", q.provider)))?;

    let base = reqwest::Url::parse(&provider.endpoint)
        .map_err(|e| GatewayError::Internal(format!("invalid provider endpoint: {e}")))?;
    let mut probe_url = base.clone();
    probe_url.set_path("/v1/models");
    probe_url.set_query(None);

    let resp = state
        .http
        .get(probe_url)
        .bearer_auth(&provider.api_key)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| GatewayError::UpstreamTransportError {
            provider: provider.name.clone(),
            message: e.to_string(),
        })?;

    if !resp.status().is_success() {
        return Err(GatewayError::UpstreamStatusError {
            provider: provider.name,
            status: resp.status().as_u16(),
        });
    }

    let body: serde_json::Value = resp.json().await.map_err(|e| GatewayError::UpstreamStreamError {
        provider: provider.name,
        message: e.to_string(),
    })?;

    let raw = body
        .get("data")
        .cloned()
        .unwrap_or_else(|| body.get("models").cloned().unwrap_or(serde_json::Value::Array(vec![])));

    let fallback_created = chrono::Utc::now().timestamp_millis();
    let data: Vec<serde_json::Value> = raw
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|entry| {
            let id = entry.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let created = entry.get("created").and_then(|v| v.as_i64()).unwrap_or(fallback_created);
            let owned_by = entry.get("owned_by").and_then(|v| v.as_str()).unwrap_or("gateway").to_string();
            serde_json::json!({ "id": id, "object": "model", "created": created, "owned_by": owned_by })
        })
        .collect();

    Ok(Json(serde_json::json!({ "object": "list", "data": data })))
}
