//! Integration tests for batch scheduling and the fleet heartbeat.
//!
//! Tests cover:
//! - Startup delay suppression
//! - Per-location batch window
//! - Single pass under concurrent ticks
//! - Blacklisted batch modules
//! - Scheduler tick delivered as a system message
//! - Watchdog heartbeats and failure counting

mod common;

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;

use common::{harness, harness_with, manifest, plugin_config, Harness, HOME};
use gsm_core::cloud::{instance_queue_name, CloudBackend, FleetHealth, KeyValueExt, QueueService};
use gsm_core::config::{PluginConfig, SchedulerConfig};
use gsm_core::manager::SchedulerHook;
use gsm_core::message::{Message, PluginId, PluginVersion, SystemCommand};
use gsm_core::modules::builtin::{COUNTER, ECHO};
use gsm_core::scheduler::{last_run_key, BatchScheduler, TickOutcome, Watchdog, SCHEDULER_CATEGORY};

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        startup_delay: Duration::from_secs(300),
        batch_window: Duration::from_secs(50),
        ..SchedulerConfig::default()
    }
}

/// A scheduler whose process started long enough ago to dispatch.
fn warm_scheduler(h: &Harness) -> BatchScheduler {
    BatchScheduler::new(Arc::clone(&h.manager), scheduler_config())
        .with_process_start(Utc::now() - chrono::Duration::minutes(10))
}

async fn install_counter(h: &Harness, plugin_id: i64) {
    h.manager
        .install_module(
            PluginId(plugin_id),
            PluginVersion(1.0),
            "batch",
            manifest(plugin_id, 1.0, "batch", &[(COUNTER, None)]),
        )
        .await
        .unwrap();
}

fn queued_commands(h: &Harness) -> Vec<SystemCommand> {
    h.cloud
        .peek_queue(&instance_queue_name(HOME, h.manager.instance_id()))
        .iter()
        .filter_map(|raw| Message::from_json(raw).ok())
        .filter_map(|m| m.system_command().and_then(|c| c.ok()))
        .collect()
}

// ============================================================================
// Preconditions
// ============================================================================

#[tokio::test]
async fn test_tick_suppressed_during_startup_delay() {
    let h = harness();
    install_counter(&h, 7).await;

    let scheduler = BatchScheduler::new(Arc::clone(&h.manager), scheduler_config());
    assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::TooEarly);
    assert_eq!(scheduler.passes(), 0);
    assert!(scheduler.last_run().await.unwrap().is_none());
}

#[tokio::test]
async fn test_dispatch_sends_run_batch_to_own_queue() {
    let h = harness();
    install_counter(&h, 7).await;
    h.manager
        .install_module(
            PluginId(8),
            PluginVersion(1.0),
            "events",
            manifest(8, 1.0, "events", &[(ECHO, None)]),
        )
        .await
        .unwrap();

    let scheduler = warm_scheduler(&h);
    let outcome = scheduler.tick().await.unwrap();

    assert_eq!(outcome, TickOutcome::Dispatched { modules: 1, failures: 0 });
    assert_eq!(
        queued_commands(&h),
        vec![SystemCommand::RunBatch {
            plugin_id: PluginId(7),
            version: PluginVersion(1.0),
            module_class: COUNTER.to_string(),
        }]
    );
    assert!(scheduler.last_run().await.unwrap().is_some());
    assert!(!scheduler.is_running());
}

#[tokio::test]
async fn test_second_tick_within_window_is_skipped() {
    let h = harness();
    install_counter(&h, 7).await;
    let scheduler = warm_scheduler(&h);

    assert!(matches!(scheduler.tick().await.unwrap(), TickOutcome::Dispatched { .. }));
    assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::WithinWindow);
    assert_eq!(scheduler.passes(), 1);
    assert_eq!(queued_commands(&h).len(), 1);
}

#[tokio::test]
async fn test_window_is_shared_by_the_location() {
    let h = harness();
    install_counter(&h, 7).await;

    // Another instance of the location ran its batch 10 seconds ago.
    h.cloud
        .store_as(SCHEDULER_CATEGORY, &last_run_key(HOME), &(Utc::now() - chrono::Duration::seconds(10)))
        .await
        .unwrap();
    let scheduler = warm_scheduler(&h);
    assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::WithinWindow);

    // Once the window has passed this instance takes over.
    h.cloud
        .store_as(SCHEDULER_CATEGORY, &last_run_key(HOME), &(Utc::now() - chrono::Duration::seconds(60)))
        .await
        .unwrap();
    assert!(matches!(scheduler.tick().await.unwrap(), TickOutcome::Dispatched { modules: 1, .. }));
}

#[tokio::test]
async fn test_concurrent_ticks_run_one_pass() {
    let h = harness();
    install_counter(&h, 7).await;
    let scheduler = Arc::new(warm_scheduler(&h));

    let ticks: Vec<_> = (0..8)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.tick().await })
        })
        .collect();

    let mut dispatched = 0;
    for tick in ticks {
        match tick.await.unwrap().unwrap() {
            TickOutcome::Dispatched { .. } => dispatched += 1,
            TickOutcome::Busy | TickOutcome::WithinWindow => {}
            TickOutcome::TooEarly => panic!("scheduler should be warm"),
        }
    }

    assert_eq!(dispatched, 1);
    assert_eq!(scheduler.passes(), 1);
    assert_eq!(queued_commands(&h).len(), 1);
}

// ============================================================================
// Blacklist
// ============================================================================

#[tokio::test]
async fn test_blacklisted_plugin_is_not_dispatched() {
    let h = harness_with(PluginConfig {
        blacklist: vec!["7".to_string()],
        ..plugin_config()
    });
    install_counter(&h, 7).await;
    install_counter(&h, 9).await;

    let outcome = warm_scheduler(&h).tick().await.unwrap();

    assert_eq!(outcome, TickOutcome::Dispatched { modules: 1, failures: 0 });
    let commands = queued_commands(&h);
    assert!(matches!(
        &commands[..],
        [SystemCommand::RunBatch { plugin_id: PluginId(9), .. }]
    ));
}

#[tokio::test]
async fn test_blacklist_by_class_only_blocks_that_class() {
    let h = harness_with(PluginConfig {
        blacklist: vec![format!("7:{}", ECHO)],
        ..plugin_config()
    });
    install_counter(&h, 7).await;

    let outcome = warm_scheduler(&h).tick().await.unwrap();
    assert_eq!(outcome, TickOutcome::Dispatched { modules: 1, failures: 0 });
}

// ============================================================================
// System Messages
// ============================================================================

#[tokio::test]
async fn test_scheduler_tick_message_drives_attached_scheduler() {
    let h = harness();
    install_counter(&h, 7).await;
    let scheduler = Arc::new(warm_scheduler(&h));
    let hook: Weak<BatchScheduler> = Arc::downgrade(&scheduler);
    h.manager.attach_scheduler(hook as Weak<dyn SchedulerHook>);

    let tick = Message::system(&SystemCommand::SchedulerTick).unwrap();
    assert!(h.manager.process(&tick).await.unwrap().is_none());

    assert_eq!(scheduler.passes(), 1);
}

#[tokio::test]
async fn test_scheduler_tick_without_scheduler_is_ignored() {
    let h = harness();
    let tick = Message::system(&SystemCommand::SchedulerTick).unwrap();
    assert!(h.manager.process(&tick).await.unwrap().is_none());
}

#[tokio::test]
async fn test_run_batch_message_runs_module() {
    let h = harness();
    install_counter(&h, 7).await;
    warm_scheduler(&h).tick().await.unwrap();

    let raw = h
        .cloud
        .peek_queue(&instance_queue_name(HOME, h.manager.instance_id()))
        .pop()
        .unwrap();
    let message = Message::from_json(&raw).unwrap();

    assert!(h.manager.process(&message).await.unwrap().is_none());
    assert_eq!(h.manager.timeout_guard().timeout_count(), 0);
}

// ============================================================================
// Watchdog
// ============================================================================

#[tokio::test]
async fn test_watchdog_beat_registers_location() {
    let h = harness();
    let queue = h
        .cloud
        .create_instance_queue(HOME, h.manager.instance_id())
        .await
        .unwrap();
    let watchdog = Watchdog::new(
        h.cloud.clone() as Arc<dyn CloudBackend>,
        HOME,
        h.manager.instance_id(),
        Arc::new(RwLock::new(queue.clone())),
        Duration::from_secs(60),
    );

    watchdog.beat().await.unwrap();

    let record = h.cloud.fleet_record(h.manager.instance_id()).unwrap();
    assert_eq!(record.location, HOME);
    assert_eq!(record.queue, queue);
    assert_eq!(h.cloud.locations().await.unwrap(), vec![HOME.to_string()]);
    assert_eq!(watchdog.beats(), 1);
}

#[tokio::test]
async fn test_watchdog_run_survives_failures() {
    let h = harness();
    let queue = h
        .cloud
        .create_instance_queue(HOME, h.manager.instance_id())
        .await
        .unwrap();
    let watchdog = Arc::new(Watchdog::new(
        h.cloud.clone() as Arc<dyn CloudBackend>,
        HOME,
        h.manager.instance_id(),
        Arc::new(RwLock::new(queue)),
        Duration::from_millis(10),
    ));
    h.cloud.set_watchdog_failing(true);

    let shutdown = tokio_util::sync::CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&watchdog).run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(60)).await;
    h.cloud.set_watchdog_failing(false);
    tokio::time::sleep(Duration::from_millis(60)).await;
    shutdown.cancel();
    task.await.unwrap();

    assert!(watchdog.failures() >= 1);
    assert!(watchdog.beats() >= 1);
}
