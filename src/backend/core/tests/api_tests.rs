//! Integration tests for the HTTP surface.
//!
//! Tests cover:
//! - Health and liveness endpoints
//! - The `/metrics` document and its `base` section
//! - Basic auth on the admin routes
//! - Module and virtual host administration
//! - Dispatch of unmatched paths to web modules

mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use base64::Engine;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceExt;

use common::{harness, manifest, Harness};
use gsm_core::api::{build_router, AppState};
use gsm_core::cloud::CloudBackend;
use gsm_core::config::{AdminConfig, SchedulerConfig};
use gsm_core::health::{BackendHealthChecker, HealthConfig, HealthService};
use gsm_core::queue::{WorkerPool, WorkerPoolConfig};
use gsm_core::scheduler::BatchScheduler;
use gsm_core::telemetry::MetricsRegistry;
use gsm_core::modules::builtin::{ECHO, HELLO};

const ADMIN_USER: &str = "admin";
const ADMIN_PASSWORD: &str = "s3cret";

fn app_with_admin(h: &Harness, admin: AdminConfig) -> Router {
    let mut health = HealthService::new(HealthConfig::default());
    health.register_checker(Arc::new(BackendHealthChecker::new(
        h.cloud.clone() as Arc<dyn CloudBackend>
    )));

    build_router(AppState {
        manager: Arc::clone(&h.manager),
        scheduler: Arc::new(BatchScheduler::new(Arc::clone(&h.manager), SchedulerConfig::default())),
        health: Arc::new(health),
        pool: Arc::new(WorkerPool::new(WorkerPoolConfig::default())),
        metrics: MetricsRegistry::disabled(),
        admin: Arc::new(admin),
        started_at: Instant::now(),
    })
}

fn app(h: &Harness) -> Router {
    app_with_admin(
        h,
        AdminConfig {
            username: ADMIN_USER.into(),
            password: Some(ADMIN_PASSWORD.into()),
        },
    )
}

fn basic(user: &str, password: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password));
    format!("Basic {}", encoded)
}

fn admin_request(method: &str, uri: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, basic(ADMIN_USER, ADMIN_PASSWORD))
        .body(body)
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn install_hello(h: &Harness) {
    h.manager
        .install_module(
            gsm_core::message::PluginId(1),
            gsm_core::message::PluginVersion(1.0),
            "hello",
            manifest(1, 1.0, "hello", &[(HELLO, None)]),
        )
        .await
        .unwrap();
}

// ============================================================================
// Health & Metrics
// ============================================================================

#[tokio::test]
async fn test_health_reports_backend_component() {
    let h = harness();
    let response = app(&h)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["components"][0]["name"], "backend");
}

#[tokio::test]
async fn test_liveness() {
    let h = harness();
    let response = app(&h)
        .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_document_has_base_section() {
    let h = harness();
    let response = app(&h)
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["base"].is_object());
    assert!(body["base"]["cpu"]["availableProcessors"].as_u64().unwrap() >= 1);
    assert!(body["monitoring"].is_array());
    assert!(body["backend"].is_object());
}

#[tokio::test]
async fn test_prometheus_endpoint_missing_when_disabled() {
    let h = harness();
    let response = app(&h)
        .oneshot(Request::get("/metrics/prometheus").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// Admin Authentication
// ============================================================================

#[tokio::test]
async fn test_admin_requires_credentials() {
    let h = harness();
    let response = app(&h)
        .oneshot(Request::get("/admin/modules").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
}

#[tokio::test]
async fn test_admin_rejects_wrong_password() {
    let h = harness();
    let response = app(&h)
        .oneshot(
            Request::get("/admin/modules")
                .header(header::AUTHORIZATION, basic(ADMIN_USER, "guess"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_locked_without_configured_password() {
    let h = harness();
    let router = app_with_admin(
        &h,
        AdminConfig {
            username: ADMIN_USER.into(),
            password: None,
        },
    );
    let response = router
        .oneshot(admin_request("GET", "/admin/modules", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ============================================================================
// Administration
// ============================================================================

#[tokio::test]
async fn test_upload_then_list_modules() {
    let h = harness();
    let router = app(&h);

    let upload = router
        .clone()
        .oneshot(admin_request(
            "POST",
            "/admin/modules?pluginId=42&version=1.0&name=echo",
            Body::from(manifest(42, 1.0, "echo", &[(ECHO, None)])),
        ))
        .await
        .unwrap();
    assert_eq!(upload.status(), StatusCode::CREATED);

    let list = router
        .oneshot(admin_request("GET", "/admin/modules", Body::empty()))
        .await
        .unwrap();
    assert_eq!(list.status(), StatusCode::OK);
    let body = json_body(list).await;
    assert_eq!(body["data"][0]["pluginId"], 42);
    assert_eq!(body["data"][0]["implementationClassName"], ECHO);
}

#[tokio::test]
async fn test_delete_unknown_archive_is_not_an_error() {
    let h = harness();
    let response = app(&h)
        .oneshot(admin_request("DELETE", "/admin/modules/9/1.0", Body::empty()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["data"]["deleted"], false);
}

#[tokio::test]
async fn test_invalid_plugin_id_is_rejected() {
    let h = harness();
    let response = app(&h)
        .oneshot(admin_request("POST", "/admin/modules/0/1.0/enable", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_virtual_host_round_trip() {
    let h = harness();
    install_hello(&h).await;
    let router = app(&h);

    let set = router
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/admin/vhosts/www.example.com")
                .header(header::AUTHORIZATION, basic(ADMIN_USER, ADMIN_PASSWORD))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"path":"/1/v1.0"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(set.status(), StatusCode::NO_CONTENT);

    let routed = router
        .clone()
        .oneshot(
            Request::get("/greet")
                .header(header::HOST, "www.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(routed.status(), StatusCode::OK);
    assert_eq!(json_body(routed).await["greeting"], "Hello");

    let removed = router
        .clone()
        .oneshot(admin_request("DELETE", "/admin/vhosts/www.example.com", Body::empty()))
        .await
        .unwrap();
    assert_eq!(removed.status(), StatusCode::NO_CONTENT);

    let again = router
        .oneshot(admin_request("DELETE", "/admin/vhosts/www.example.com", Body::empty()))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// Module Dispatch
// ============================================================================

#[tokio::test]
async fn test_direct_module_path_dispatch() {
    let h = harness();
    install_hello(&h).await;

    let response = app(&h)
        .oneshot(Request::get("/1/v1.0/anything").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["pluginId"], 1);
    assert_eq!(body["method"], "GET");
}

#[tokio::test]
async fn test_unmapped_path_lists_known_mappings() {
    let h = harness();
    install_hello(&h).await;

    let response = app(&h)
        .oneshot(Request::get("/nowhere").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.starts_with("no module mapping defined for: /nowhere supported mappings are: "));
    assert!(message.contains("/1/v1.0"));
}
