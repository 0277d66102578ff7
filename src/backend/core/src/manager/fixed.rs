//! Supervision of long-lived fixed module tasks.

use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::message::{PluginId, PluginVersion};
use crate::modules::catalog::panic_message;
use crate::modules::{run_with_module_context, IsolationUnit, ModuleContext};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FixedKey {
    pub plugin_id: PluginId,
    pub version: PluginVersion,
    pub module_class: String,
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct FixedSupervisor {
    root: CancellationToken,
    tasks: Mutex<HashMap<FixedKey, RunningTask>>,
}

impl FixedSupervisor {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the fixed task of `ctx.module_class` from `unit`.
    ///
    /// Returns false when the task is already running or the module has no
    /// fixed capability.
    pub fn start(&self, unit: Arc<IsolationUnit>, ctx: ModuleContext) -> bool {
        let key = FixedKey {
            plugin_id: ctx.plugin_id,
            version: ctx.version,
            module_class: ctx.module_class.clone(),
        };

        let has_fixed = unit
            .module(&key.module_class)
            .map(|m| m.instance.as_fixed().is_some())
            .unwrap_or(false);
        if !has_fixed {
            return false;
        }

        let mut tasks = self.tasks.lock();
        tasks.retain(|_, t| !t.handle.is_finished());
        if tasks.contains_key(&key) {
            return false;
        }

        let token = self.root.child_token();
        let task_token = token.clone();
        let class = key.module_class.clone();

        let handle = tokio::spawn(async move {
            let Some(task) = unit.module(&class).and_then(|m| m.instance.as_fixed()) else {
                return;
            };
            info!(plugin_id = %ctx.plugin_id, module_class = %class, "Fixed module started");

            let run = run_with_module_context(ctx.clone(), task.run(&ctx, task_token));
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(())) => {
                    info!(plugin_id = %ctx.plugin_id, module_class = %class, "Fixed module stopped");
                }
                Ok(Err(e)) => {
                    warn!(plugin_id = %ctx.plugin_id, module_class = %class, error = %e, "Fixed module failed");
                }
                Err(payload) => {
                    error!(
                        plugin_id = %ctx.plugin_id,
                        module_class = %class,
                        panic = %panic_message(payload),
                        "Fixed module panicked"
                    );
                }
            }
        });

        tasks.insert(key, RunningTask { token, handle });
        true
    }

    /// Cancel every task of one plugin version; returns how many were signalled.
    pub fn stop(&self, plugin_id: PluginId, version: PluginVersion) -> usize {
        let mut tasks = self.tasks.lock();
        let keys: Vec<FixedKey> = tasks
            .keys()
            .filter(|k| k.plugin_id == plugin_id && k.version == version)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(task) = tasks.remove(key) {
                task.token.cancel();
            }
        }
        keys.len()
    }

    /// Cancel all tasks and wait up to `grace` for them; stragglers are aborted.
    pub async fn stop_all(&self, grace: Duration) {
        let tasks: Vec<(FixedKey, RunningTask)> = self.tasks.lock().drain().collect();
        for (_, task) in &tasks {
            task.token.cancel();
        }

        let deadline = tokio::time::Instant::now() + grace;
        for (key, task) in tasks {
            let abort = task.handle.abort_handle();
            if tokio::time::timeout_at(deadline, task.handle).await.is_err() {
                warn!(
                    plugin_id = %key.plugin_id,
                    module_class = %key.module_class,
                    "Fixed module ignored cancellation, aborting"
                );
                abort.abort();
            }
        }
    }

    pub fn running(&self) -> Vec<FixedKey> {
        let mut keys: Vec<FixedKey> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, t)| !t.handle.is_finished())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}
