//! # Scheduler
//!
//! Leader-less batch triggering plus the fleet heartbeat.
//!
//! Every instance ticks on its own. A tick dispatches the location's batch
//! modules only when the instance has been up long enough and the shared
//! last-run timestamp of its location is older than the batch window.
//! Duplicate dispatches across instances within one window are possible
//! and tolerated; within one instance a compare-and-set flag serializes
//! passes.

pub mod watchdog;

pub use watchdog::Watchdog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloud::{instance_queue_name, KeyValueExt};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::manager::{PluginManager, SchedulerHook};
use crate::message::{Message, PluginId, SystemCommand};
use crate::modules::Capability;

pub const SCHEDULER_CATEGORY: &str = "scheduler";

pub fn last_run_key(location: &str) -> String {
    format!("last-batch-run:{}", location)
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum TickOutcome {
    /// Another pass is running on this instance
    Busy,
    /// Instance uptime is below the startup delay
    TooEarly,
    /// The location ran its batch modules within the window
    WithinWindow,
    Dispatched { modules: usize, failures: usize },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Blacklist
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
struct BlacklistEntry {
    plugin_id: PluginId,
    /// `None` blocks every class of the plugin
    module_class: Option<String>,
}

fn parse_blacklist(entries: &[String]) -> Vec<BlacklistEntry> {
    entries
        .iter()
        .filter_map(|entry| {
            let (id, class) = entry.split_once(':').unwrap_or((entry.as_str(), "*"));
            match id.trim().parse::<i64>() {
                Ok(id) => Some(BlacklistEntry {
                    plugin_id: PluginId(id),
                    module_class: match class.trim() {
                        "*" | "" => None,
                        class => Some(class.to_string()),
                    },
                }),
                Err(_) => {
                    warn!(entry = %entry, "Ignoring malformed batch blacklist entry");
                    None
                }
            }
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Batch Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Clears the running flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct BatchScheduler {
    manager: Arc<PluginManager>,
    config: SchedulerConfig,
    blacklist: Vec<BlacklistEntry>,
    batch_running: AtomicBool,
    process_start: DateTime<Utc>,
    passes: AtomicU64,
    dispatched: AtomicU64,
}

impl BatchScheduler {
    pub fn new(manager: Arc<PluginManager>, config: SchedulerConfig) -> Self {
        let blacklist = parse_blacklist(&manager.config().blacklist);
        Self {
            manager,
            config,
            blacklist,
            batch_running: AtomicBool::new(false),
            process_start: Utc::now(),
            passes: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
        }
    }

    /// Override the instant uptime is measured from.
    pub fn with_process_start(mut self, process_start: DateTime<Utc>) -> Self {
        self.process_start = process_start;
        self
    }

    pub fn process_start(&self) -> DateTime<Utc> {
        self.process_start
    }

    pub fn is_running(&self) -> bool {
        self.batch_running.load(Ordering::SeqCst)
    }

    /// Dispatch passes that got past the preconditions.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// RunBatch messages sent so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub async fn last_run(&self) -> Result<Option<DateTime<Utc>>> {
        let key = last_run_key(self.manager.location());
        Ok(self
            .manager
            .backend()
            .retrieve_as::<DateTime<Utc>>(SCHEDULER_CATEGORY, &key)
            .await?)
    }

    fn is_blacklisted(&self, plugin_id: PluginId, module_class: &str) -> bool {
        self.blacklist.iter().any(|entry| {
            entry.plugin_id == plugin_id
                && entry
                    .module_class
                    .as_deref()
                    .map(|c| c == module_class)
                    .unwrap_or(true)
        })
    }

    /// Run the batch trigger protocol once.
    pub async fn tick(&self) -> Result<TickOutcome> {
        if self
            .batch_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Batch pass already running");
            return Ok(TickOutcome::Busy);
        }
        let _guard = PassGuard(&self.batch_running);

        let now = Utc::now();
        let uptime = now.signed_duration_since(self.process_start).to_std().unwrap_or_default();
        if uptime < self.config.startup_delay {
            debug!(uptime_secs = uptime.as_secs(), "Instance too young for batch dispatch");
            return Ok(TickOutcome::TooEarly);
        }

        if let Some(last) = self.last_run().await? {
            let since = now.signed_duration_since(last).to_std().unwrap_or_default();
            if since < self.config.batch_window {
                debug!(since_secs = since.as_secs(), "Location batch ran recently");
                return Ok(TickOutcome::WithinWindow);
            }
        }

        self.passes.fetch_add(1, Ordering::Relaxed);
        let outcome = self.dispatch().await?;

        let key = last_run_key(self.manager.location());
        self.manager
            .backend()
            .store_as(SCHEDULER_CATEGORY, &key, &Utc::now())
            .await?;
        Ok(outcome)
    }

    async fn dispatch(&self) -> Result<TickOutcome> {
        let manager = &self.manager;
        let backend = manager.backend();
        let location = manager.location();

        let queue_name = instance_queue_name(location, manager.instance_id());
        let queue = match backend.queue_id(&queue_name).await? {
            Some(queue) => queue,
            None => backend.create_instance_queue(location, manager.instance_id()).await?,
        };

        let live = manager.get_live_module_list(location).await;
        let mut sent = 0;
        let mut failures = Vec::new();

        for info in live.iter().filter(|m| m.capabilities.contains(&Capability::Batch)) {
            if self.is_blacklisted(info.plugin_id, &info.implementation_class_name) {
                debug!(plugin_id = %info.plugin_id, module_class = %info.implementation_class_name, "Batch module blacklisted");
                continue;
            }

            let command = SystemCommand::RunBatch {
                plugin_id: info.plugin_id,
                version: info.version,
                module_class: info.implementation_class_name.clone(),
            };
            let result = async {
                let message = Message::system(&command)?.with_source(
                    manager.instance_id(),
                    location,
                    Some(info.plugin_id),
                );
                backend.send_message(&queue, &message.to_json()?).await?;
                Ok::<_, crate::error::GsmError>(())
            }
            .await;

            match result {
                Ok(()) => sent += 1,
                Err(e) => failures.push(format!("{}:{}: {}", info.plugin_id, info.implementation_class_name, e)),
            }
        }

        if !failures.is_empty() {
            warn!(location = %location, failures = ?failures, "Some batch modules could not be dispatched");
        }
        counter!("gsm_batch_dispatches_total").increment(sent as u64);
        self.dispatched.fetch_add(sent as u64, Ordering::Relaxed);
        info!(location = %location, modules = sent, failures = failures.len(), "Batch modules dispatched");

        Ok(TickOutcome::Dispatched {
            modules: sent,
            failures: failures.len(),
        })
    }

    /// Tick every `tick_interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }
        debug!("Scheduler stopped");
    }
}

#[async_trait]
impl SchedulerHook for BatchScheduler {
    async fn tick(&self) -> Result<bool> {
        Ok(matches!(BatchScheduler::tick(self).await?, TickOutcome::Dispatched { .. }))
    }
}
