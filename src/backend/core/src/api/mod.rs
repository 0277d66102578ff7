//! HTTP surface of a server instance.
//!
//! - `/health`, `/health/live`: health report and liveness probe
//! - `/metrics`: JSON process document, `/metrics/prometheus`: text exposition
//! - `/admin/...`: module and virtual host administration (basic auth)
//! - everything else: dispatched to web modules by path or virtual host

mod auth;
mod handlers;
pub mod metrics;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{enabled, trace, Level};

use crate::config::AdminConfig;
use crate::error::{GsmError, Result};
use crate::health::HealthService;
use crate::manager::PluginManager;
use crate::modules::{WebRequest, WebResponse};
use crate::telemetry::redact;
use crate::queue::WorkerPool;
use crate::scheduler::BatchScheduler;
use crate::telemetry::MetricsRegistry;

pub use auth::{decode_basic_auth, require_admin};

/// Largest request body forwarded to a module or accepted as an archive.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PluginManager>,
    pub scheduler: Arc<BatchScheduler>,
    pub health: Arc<HealthService>,
    pub pool: Arc<WorkerPool>,
    pub metrics: MetricsRegistry,
    pub admin: Arc<AdminConfig>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let admin = Router::new()
        .route(
            "/modules",
            get(handlers::list_modules).post(handlers::install_module),
        )
        .route("/modules/:id/:version", axum::routing::delete(handlers::delete_module))
        .route("/modules/:id/:version/enable", post(handlers::enable_module))
        .route("/modules/:id/:version/disable", post(handlers::disable_module))
        .route(
            "/modules/:id/:version/config",
            get(handlers::get_module_config).put(handlers::set_module_config),
        )
        .route("/vhosts", get(handlers::list_vhosts))
        .route(
            "/vhosts/:host",
            put(handlers::set_vhost).delete(handlers::remove_vhost),
        )
        .route("/scheduler/tick", post(handlers::scheduler_tick))
        .route_layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state.admin),
            require_admin,
        ));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/health/live", get(handlers::liveness_check))
        .route("/metrics", get(handlers::metrics_document))
        .route("/metrics/prometheus", get(handlers::prometheus_metrics))
        .nest("/admin", admin)
        .fallback(dispatch_to_module)
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Route a request that matched no built-in path to a web module.
async fn dispatch_to_module(State(state): State<AppState>, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.host().map(str::to_string));
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| GsmError::validation(format!("unreadable request body: {}", e)))?;

    let path = parts.uri.path().to_string();
    if enabled!(Level::TRACE) {
        let headers: Vec<(&str, &str)> = parts
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), redact(name.as_str(), value.to_str().unwrap_or("<binary>"))))
            .collect();
        trace!(path = %path, host = ?host, headers = ?headers, "Module request");
    }

    let web_request = WebRequest {
        method: parts.method,
        subpath: path.clone(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
    };

    let response = state
        .manager
        .process_http(host.as_deref(), &path, web_request)
        .await?;
    Ok(into_http_response(response))
}

fn into_http_response(response: WebResponse) -> Response {
    let mut http = Response::new(Body::from(response.body));
    *http.status_mut() = response.status;
    if let Ok(content_type) = HeaderValue::from_str(&response.content_type) {
        http.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    http
}

/// Standard API response wrapper.
#[derive(Debug, serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }
}

impl<T: serde::Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        axum::Json(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("test data");
        assert!(response.success);
        assert_eq!(response.data, Some("test data"));
    }

    #[test]
    fn test_web_response_conversion() {
        let response = into_http_response(WebResponse::text("hi").with_status(StatusCode::ACCEPTED));
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
