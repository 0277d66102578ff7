//! Request handlers for the built-in routes.
//!
//! All handlers return `Result<impl IntoResponse, GsmError>` so errors map
//! to HTTP status codes through `GsmError`'s `IntoResponse`.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use super::{metrics, ApiResponse, AppState};
use crate::error::{GsmError, Result};
use crate::health::LivenessResponse;
use crate::message::{PluginId, PluginVersion};
use crate::modules::ModuleInfo;

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.check_health().await;
    let status = StatusCode::from_u16(report.status.to_http_status())
        .unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    (status, Json(report))
}

pub async fn liveness_check() -> impl IntoResponse {
    Json(LivenessResponse::alive())
}

pub async fn metrics_document(State(state): State<AppState>) -> impl IntoResponse {
    Json(metrics::build_document(&state).await)
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> Result<impl IntoResponse> {
    if !state.metrics.is_enabled() {
        return Err(GsmError::not_found("Metrics exporter", "prometheus"));
    }
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    ))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Modules
// ═══════════════════════════════════════════════════════════════════════════════

fn parse_archive_path(id: i64, version: &str) -> Result<(PluginId, PluginVersion)> {
    if id <= 0 {
        return Err(GsmError::validation("plugin id must be positive"));
    }
    Ok((PluginId(id), version.parse::<PluginVersion>()?))
}

pub async fn list_modules(State(state): State<AppState>) -> Result<Json<ApiResponse<Vec<ModuleInfo>>>> {
    let modules = state.manager.list_modules().await?;
    Ok(Json(ApiResponse::success(modules)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallParams {
    pub plugin_id: i64,
    pub version: String,
    pub name: String,
}

pub async fn install_module(
    State(state): State<AppState>,
    Query(params): Query<InstallParams>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    if body.is_empty() {
        return Err(GsmError::validation("archive body is empty"));
    }
    let (plugin_id, version) = parse_archive_path(params.plugin_id, &params.version)?;
    let rows = state
        .manager
        .install_module(plugin_id, version, &params.name, body.to_vec())
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(rows))))
}

pub async fn delete_module(
    State(state): State<AppState>,
    Path((id, version)): Path<(i64, String)>,
) -> Result<impl IntoResponse> {
    let (plugin_id, version) = parse_archive_path(id, &version)?;
    let deleted = state
        .manager
        .delete_plugin(plugin_id, version, &state.admin.username)
        .await?;
    Ok(Json(ApiResponse::success(serde_json::json!({ "deleted": deleted }))))
}

pub async fn enable_module(
    State(state): State<AppState>,
    Path((id, version)): Path<(i64, String)>,
) -> Result<Json<ApiResponse<Vec<ModuleInfo>>>> {
    let (plugin_id, version) = parse_archive_path(id, &version)?;
    let rows = state.manager.enable_module(plugin_id, version).await?;
    Ok(Json(ApiResponse::success(rows)))
}

pub async fn disable_module(
    State(state): State<AppState>,
    Path((id, version)): Path<(i64, String)>,
) -> Result<Json<ApiResponse<Vec<ModuleInfo>>>> {
    let (plugin_id, version) = parse_archive_path(id, &version)?;
    let rows = state.manager.disable_module(plugin_id, version).await?;
    Ok(Json(ApiResponse::success(rows)))
}

pub async fn get_module_config(
    State(state): State<AppState>,
    Path((id, version)): Path<(i64, String)>,
) -> Result<impl IntoResponse> {
    let (plugin_id, version) = parse_archive_path(id, &version)?;
    let configuration = state
        .manager
        .module_configuration(plugin_id, version)
        .await?
        .unwrap_or(serde_json::Value::Null);
    Ok(Json(ApiResponse::success(configuration)))
}

pub async fn set_module_config(
    State(state): State<AppState>,
    Path((id, version)): Path<(i64, String)>,
    Json(configuration): Json<serde_json::Value>,
) -> Result<impl IntoResponse> {
    let (plugin_id, version) = parse_archive_path(id, &version)?;
    if !configuration.is_object() {
        return Err(GsmError::validation("module configuration must be a JSON object"));
    }
    state
        .manager
        .set_module_configuration(plugin_id, version, configuration)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Virtual Hosts
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct VirtualHostBody {
    pub path: String,
}

pub async fn list_vhosts(State(state): State<AppState>) -> impl IntoResponse {
    let hosts = state.manager.virtual_hosts();
    let sorted: std::collections::BTreeMap<String, String> =
        hosts.iter().map(|(h, p)| (h.clone(), p.clone())).collect();
    Json(ApiResponse::success(sorted))
}

pub async fn set_vhost(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Json(body): Json<VirtualHostBody>,
) -> Result<impl IntoResponse> {
    state.manager.set_virtual_host(&host, &body.path).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_vhost(
    State(state): State<AppState>,
    Path(host): Path<String>,
) -> Result<impl IntoResponse> {
    if !state.manager.remove_virtual_host(&host).await? {
        return Err(GsmError::not_found("Virtual host", host));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn scheduler_tick(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let outcome = state.scheduler.tick().await?;
    Ok(Json(ApiResponse::success(outcome)))
}
