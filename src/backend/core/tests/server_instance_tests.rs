//! Integration tests for the server instance lifecycle.
//!
//! Tests cover:
//! - Instance identity persisted across restarts
//! - Startup: queues, fleet registration, listeners, HTTP
//! - Shutdown: listeners stopped, instance queue deleted, idempotent stop
//! - Failed startup leaves nothing running

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::catalog;
use gsm_core::cloud::{instance_queue_name, location_queue_name, CloudBackend, InMemoryCloud, QueueService};
use gsm_core::config::Config;
use gsm_core::manager::RecordingExit;
use gsm_core::message::Message;
use gsm_core::server::ServerInstance;

fn config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".into();
    config.server.port = 0;
    config.server.shutdown_grace = Duration::from_secs(2);
    config.instance.location = "site-a".into();
    config.instance.id_file_dir = Some(dir.path().to_path_buf());
    config.queues.poll_wait = Duration::from_millis(50);
    config
}

fn instance(cloud: &Arc<InMemoryCloud>, config: Config) -> ServerInstance {
    ServerInstance::init(
        config,
        cloud.clone() as Arc<dyn CloudBackend>,
        catalog(),
        Arc::new(RecordingExit::new()),
    )
    .unwrap()
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn test_identity_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(InMemoryCloud::new());

    let first = instance(&cloud, config(&dir)).identity().id;
    let second = instance(&cloud, config(&dir)).identity().id;

    assert_eq!(first, second);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_start_brings_up_queues_listeners_and_http() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(InMemoryCloud::new());
    let server = instance(&cloud, config(&dir));
    let id = server.identity().id;

    let addr = server.start().await.unwrap();

    assert!(server.is_running());
    assert_eq!(server.http_addr(), Some(addr));
    assert_ne!(addr.port(), 0);

    assert!(cloud.queue_id(&instance_queue_name("site-a", id)).await.unwrap().is_some());
    assert!(cloud.queue_id(&location_queue_name("site-a")).await.unwrap().is_some());
    assert_eq!(cloud.fleet_record(id).unwrap().location, "site-a");

    let listeners = server.listeners();
    assert_eq!(listeners.len(), 3);
    assert!(listeners.iter().all(|l| !l.is_dead()));

    let live = http_get(addr, "/health/live").await;
    assert!(live.starts_with("HTTP/1.1 200"), "unexpected response: {}", live);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(InMemoryCloud::new());
    let server = instance(&cloud, config(&dir));

    server.start().await.unwrap();
    assert!(server.start().await.is_err());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_deletes_instance_queue_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(InMemoryCloud::new());
    let server = instance(&cloud, config(&dir));
    let queue = instance_queue_name("site-a", server.identity().id);

    let addr = server.start().await.unwrap();
    server.stop().await.unwrap();

    assert!(!server.is_running());
    assert!(cloud.queue_id(&queue).await.unwrap().is_none());
    assert!(cloud.queue_id(&location_queue_name("site-a")).await.unwrap().is_some());
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_startup_survives_failed_fleet_registration() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(InMemoryCloud::new());
    cloud.set_watchdog_failing(true);
    let server = instance(&cloud, config(&dir));

    server.start().await.unwrap();
    assert!(cloud.fleet_record(server.identity().id).is_none());
    assert!(cloud.watchdog_calls() >= 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_bind_leaves_nothing_running() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(InMemoryCloud::new());
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = config(&dir);
    config.server.port = occupied.local_addr().unwrap().port();
    let server = instance(&cloud, config);

    assert!(server.start().await.is_err());
    assert!(!server.is_running());
    assert!(server.listeners().is_empty());
    assert!(cloud
        .queue_id(&instance_queue_name("site-a", server.identity().id))
        .await
        .unwrap()
        .is_none());
    server.stop().await.unwrap();

    let queue = cloud.define_queue(&location_queue_name("site-a")).await.unwrap();
    let message = Message::to_module(1, 1.0, "gsm.builtin.Echo", serde_json::json!({}));
    cloud.send_message(&queue, &message.to_json().unwrap()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cloud.peek_queue(&location_queue_name("site-a")).len(), 1);
}
