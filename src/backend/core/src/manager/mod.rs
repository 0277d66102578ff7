//! # Plugin Manager
//!
//! The orchestration core: installs and removes archives, resolves queue
//! messages and HTTP requests to module instances, and protects the
//! process with the timeout and memory guards.
//!
//! ## Architecture
//!
//! - **Registry**: persisted [`ModuleInfo`] rows plus the live module cache
//! - **Loader**: isolation units built from archives, cached by checksum
//! - **Guards**: [`TimeoutGuard`] and [`MemoryGuard`] wrap every invocation
//! - **Monitor**: per-window HTTP and event counters
//! - **Virtual hosts**: hostname aliases for module paths
//! - **Fixed supervisor**: long-lived fixed module tasks

pub mod fixed;
pub mod guard;
pub mod monitoring;
pub mod routing;
pub mod vhost;

pub use fixed::{FixedKey, FixedSupervisor};
pub use guard::{
    ExitStrategy, FixedMemoryProbe, MemoryGuard, MemoryProbe, ProcessExit, RecordingExit,
    SystemMemoryProbe, TimeoutGuard,
};
pub use monitoring::{InvocationKind, Monitor, MonitoringSnapshot};
pub use routing::{parse_module_path, ModuleRoute};
pub use vhost::VirtualHosts;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cloud::CloudBackend;
use crate::config::PluginConfig;
use crate::error::{GsmError, Result};
use crate::message::{Message, PluginId, PluginVersion, SystemCommand};
use crate::modules::catalog::panic_message;
use crate::modules::{
    archive_name, base_path, run_with_module_context, ArchiveManifest, Capability,
    IsolationUnit, ModuleCatalog, ModuleContext, ModuleError, ModuleInfo, ModuleLoader,
    ModuleRegistry, WebRequest, WebResponse,
};

/// Receives scheduler ticks that arrive as system messages.
#[async_trait]
pub trait SchedulerHook: Send + Sync {
    async fn tick(&self) -> Result<bool>;
}

pub struct PluginManager {
    config: PluginConfig,
    backend: Arc<dyn CloudBackend>,
    instance_id: Uuid,
    location: String,
    global_queue: String,
    registry: ModuleRegistry,
    loader: ModuleLoader,
    timeout_guard: TimeoutGuard,
    memory_guard: MemoryGuard,
    exit: Arc<dyn ExitStrategy>,
    monitor: Monitor,
    vhosts: VirtualHosts,
    fixed: FixedSupervisor,
    scheduler: RwLock<Option<Weak<dyn SchedulerHook>>>,
}

impl PluginManager {
    pub fn new(
        config: PluginConfig,
        instance_id: Uuid,
        location: impl Into<String>,
        backend: Arc<dyn CloudBackend>,
        catalog: Arc<ModuleCatalog>,
        exit: Arc<dyn ExitStrategy>,
    ) -> Result<Self> {
        let location = location.into();
        let monitor = Monitor::new(&config.monitoring_windows)?;

        Ok(Self {
            registry: ModuleRegistry::new(Arc::clone(&backend), location.clone(), config.module_cache_ttl),
            loader: ModuleLoader::new(Arc::clone(&backend), catalog),
            timeout_guard: TimeoutGuard::new(
                config.invocation_timeout,
                config.max_timeout_count,
                Arc::clone(&exit),
            ),
            memory_guard: MemoryGuard::new(
                config.memory_threshold_bytes,
                Arc::new(SystemMemoryProbe),
                Arc::clone(&exit),
            ),
            vhosts: VirtualHosts::new(Arc::clone(&backend)),
            fixed: FixedSupervisor::new(CancellationToken::new()),
            global_queue: crate::config::QueueConfig::default().global_queue,
            scheduler: RwLock::new(None),
            monitor,
            exit,
            config,
            backend,
            instance_id,
            location,
        })
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_guard = MemoryGuard::new(
            self.config.memory_threshold_bytes,
            probe,
            Arc::clone(&self.exit),
        );
        self
    }

    pub fn with_global_queue(mut self, name: impl Into<String>) -> Self {
        self.global_queue = name.into();
        self
    }

    /// Fixed tasks become children of `token`.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.fixed = FixedSupervisor::new(token);
        self
    }

    pub fn attach_scheduler(&self, hook: Weak<dyn SchedulerHook>) {
        *self.scheduler.write() = Some(hook);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn global_queue(&self) -> &str {
        &self.global_queue
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn CloudBackend> {
        &self.backend
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn timeout_guard(&self) -> &TimeoutGuard {
        &self.timeout_guard
    }

    pub fn memory_guard(&self) -> &MemoryGuard {
        &self.memory_guard
    }

    pub fn fixed(&self) -> &FixedSupervisor {
        &self.fixed
    }

    pub fn monitoring_snapshot(&self) -> Vec<MonitoringSnapshot> {
        self.monitor.snapshot()
    }

    // ═════════════════════════════════════════════════════════════════════════
    // Install / Delete
    // ═════════════════════════════════════════════════════════════════════════

    /// Upload an archive and record its modules.
    ///
    /// Replaces any archive previously installed under the same
    /// `(plugin_id, version)`. Returns the recorded rows.
    pub async fn install_module(
        &self,
        plugin_id: PluginId,
        version: PluginVersion,
        display_name: &str,
        bytes: Vec<u8>,
    ) -> Result<Vec<ModuleInfo>> {
        if plugin_id.0 <= 0 {
            return Err(GsmError::validation("plugin id must be positive"));
        }
        if !(version.value() > 0.0) {
            return Err(GsmError::validation("plugin version must be positive"));
        }

        let manifest = ArchiveManifest::from_bytes(&bytes)?;
        manifest.validate()?;
        manifest.check_identity(plugin_id.0, version.value())?;

        let display_name = if display_name.trim().is_empty() {
            manifest.name.clone()
        } else {
            display_name.trim().to_string()
        };
        let archive = archive_name(plugin_id, &display_name, version);

        // Prove the new content loads before touching what is installed.
        let staging = archive_name(
            plugin_id,
            &format!("{}.staging.{}", display_name, Uuid::new_v4().simple()),
            version,
        );
        self.backend.upload_module(&staging, bytes.clone()).await?;
        let staged = self.loader.build_isolation_unit(&staging).await;
        self.loader.invalidate(&staging);
        if let Err(e) = self.backend.remove_module(&staging).await {
            warn!(archive = %staging, error = %e, "Failed to remove staging archive");
        }
        let Some(unit) = staged else {
            return Err(GsmError::archive_corrupt(
                archive,
                "no module in the archive could be instantiated",
            ));
        };

        let previous = self.registry.remove(plugin_id, version).await?;
        for old in previous.iter().filter(|m| m.archive_name != archive) {
            self.backend.remove_module(&old.archive_name).await?;
            self.loader.invalidate(&old.archive_name);
        }
        if !previous.is_empty() {
            self.fixed.stop(plugin_id, version);
        }

        self.backend.upload_module(&archive, bytes).await?;
        self.loader.invalidate(&archive);

        let installed_on = self
            .backend
            .module_install_date(&archive)
            .await?
            .unwrap_or_else(Utc::now);

        let rows: Vec<ModuleInfo> = unit
            .modules
            .iter()
            .map(|loaded| ModuleInfo {
                plugin_id,
                version,
                implementation_class_name: loaded.declaration.class.clone(),
                archive_name: archive.clone(),
                display_name: display_name.clone(),
                enabled: true,
                capabilities: loaded.capabilities.clone(),
                installed_on,
                path: loaded.declaration.path.clone(),
                locations: loaded.declaration.locations.clone(),
            })
            .collect();

        self.registry.record(&rows).await?;
        info!(
            plugin_id = %plugin_id,
            version = %version,
            archive = %archive,
            modules = rows.len(),
            "Module archive installed"
        );

        self.start_fixed_modules().await;
        self.broadcast_invalidation().await;
        Ok(rows)
    }

    /// Remove an archive and its metadata.
    ///
    /// Returns false, without error, when nothing is installed under
    /// `(plugin_id, version)`.
    pub async fn delete_plugin(
        &self,
        plugin_id: PluginId,
        version: PluginVersion,
        acting_user: &str,
    ) -> Result<bool> {
        let rows = self.registry.remove(plugin_id, version).await?;
        if rows.is_empty() {
            debug!(plugin_id = %plugin_id, version = %version, "Nothing to delete");
            return Ok(false);
        }

        self.fixed.stop(plugin_id, version);

        let archives: BTreeSet<&str> = rows.iter().map(|m| m.archive_name.as_str()).collect();
        for archive in archives {
            self.backend.remove_module(archive).await?;
            self.loader.invalidate(archive);
        }

        info!(
            plugin_id = %plugin_id,
            version = %version,
            acting_user = %acting_user,
            "Module archive deleted"
        );

        self.broadcast_invalidation().await;
        Ok(true)
    }

    /// Module classes currently loadable for `(plugin_id, version)`.
    pub async fn load_modules(&self, plugin_id: PluginId, version: PluginVersion) -> Result<Vec<String>> {
        let rows = self.registry.find(plugin_id, version).await?;
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        Ok(self.loader.list_module_types(&first.archive_name).await)
    }

    pub async fn list_modules(&self) -> Result<Vec<ModuleInfo>> {
        self.registry.all().await
    }

    pub async fn get_live_module_list(&self, location: &str) -> Arc<Vec<ModuleInfo>> {
        let live = self.registry.live_modules(location).await;
        if location == self.location {
            gauge!("gsm_live_modules").set(live.len() as f64);
        }
        live
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enablement and Configuration
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn enable_module(&self, plugin_id: PluginId, version: PluginVersion) -> Result<Vec<ModuleInfo>> {
        let rows = self.set_enabled(plugin_id, version, true).await?;
        self.start_fixed_modules().await;
        Ok(rows)
    }

    pub async fn disable_module(&self, plugin_id: PluginId, version: PluginVersion) -> Result<Vec<ModuleInfo>> {
        let rows = self.set_enabled(plugin_id, version, false).await?;
        self.fixed.stop(plugin_id, version);
        Ok(rows)
    }

    async fn set_enabled(
        &self,
        plugin_id: PluginId,
        version: PluginVersion,
        enabled: bool,
    ) -> Result<Vec<ModuleInfo>> {
        let rows = self.registry.set_enabled(plugin_id, version, enabled).await?;
        if rows.is_empty() {
            return Err(GsmError::not_found("module", format!("{}/v{}", plugin_id, version)));
        }
        info!(plugin_id = %plugin_id, version = %version, enabled, "Module enablement changed");
        self.broadcast_invalidation().await;
        Ok(rows)
    }

    pub async fn module_configuration(
        &self,
        plugin_id: PluginId,
        version: PluginVersion,
    ) -> Result<Option<serde_json::Value>> {
        let archive = self.archive_of(plugin_id, version).await?;
        Ok(self.backend.module_configuration(&archive).await?)
    }

    /// Store new configuration; loaded units and fixed tasks pick it up.
    pub async fn set_module_configuration(
        &self,
        plugin_id: PluginId,
        version: PluginVersion,
        configuration: serde_json::Value,
    ) -> Result<()> {
        let archive = self.archive_of(plugin_id, version).await?;
        self.backend
            .set_module_configuration(&archive, configuration)
            .await?;
        self.loader.invalidate(&archive);
        self.fixed.stop(plugin_id, version);
        self.start_fixed_modules().await;
        info!(plugin_id = %plugin_id, version = %version, "Module configuration updated");
        Ok(())
    }

    async fn archive_of(&self, plugin_id: PluginId, version: PluginVersion) -> Result<String> {
        self.registry
            .find(plugin_id, version)
            .await?
            .into_iter()
            .next()
            .map(|m| m.archive_name)
            .ok_or_else(|| GsmError::not_found("module", format!("{}/v{}", plugin_id, version)))
    }

    // ═════════════════════════════════════════════════════════════════════════
    // Message Processing
    // ═════════════════════════════════════════════════════════════════════════

    /// Handle one queue message.
    ///
    /// System messages are handled internally and never produce a reply.
    /// A module result becomes a reply addressed to the sender.
    pub async fn process(&self, message: &Message) -> Result<Option<Message>> {
        if message.is_system() {
            self.handle_system_message(message).await?;
            return Ok(None);
        }

        self.memory_guard.check(|| self.reclaim())?;

        let info = self
            .resolve(message.plugin_id, &message.module_class, Some(message.plugin_version), Capability::Event)
            .await
            .ok_or_else(|| GsmError::module_not_found(message.plugin_id.0, &message.module_class))?;
        let unit = self.unit_for(&info).await?;
        let handler = unit
            .module(&info.implementation_class_name)
            .and_then(|m| m.instance.as_event())
            .ok_or_else(|| GsmError::module_not_found(message.plugin_id.0, &message.module_class))?;

        let ctx = unit.context(&info.implementation_class_name, &self.location, self.instance_id);
        let payload = self
            .invoke(
                &message.describe(),
                InvocationKind::Event,
                ctx.clone(),
                handler.on_message(&ctx, message),
            )
            .await?;

        if message.is_reply() {
            return Ok(None);
        }
        Ok(payload.map(|p| message.reply(p, self.instance_id, &self.location)))
    }

    pub async fn handle_system_message(&self, message: &Message) -> Result<()> {
        let command = match message.system_command() {
            Some(command) => command?,
            None => return Err(GsmError::validation("not a system message")),
        };
        debug!(command = ?command, "System message received");

        match command {
            SystemCommand::SchedulerTick => {
                let hook = self.scheduler.read().as_ref().and_then(Weak::upgrade);
                match hook {
                    Some(hook) => {
                        hook.tick().await?;
                    }
                    None => debug!("Scheduler tick ignored, no scheduler attached"),
                }
            }
            SystemCommand::ReloadVirtualHosts => {
                self.vhosts.reload().await?;
            }
            SystemCommand::RunBatch {
                plugin_id,
                version,
                module_class,
            } => {
                self.run_batch(plugin_id, version, &module_class).await?;
            }
            SystemCommand::InvalidateModuleCache { location } => {
                self.registry.invalidate(location.as_deref());
                self.start_fixed_modules().await;
            }
        }
        Ok(())
    }

    /// Run one batch module on this instance.
    pub async fn run_batch(&self, plugin_id: PluginId, version: PluginVersion, module_class: &str) -> Result<()> {
        self.memory_guard.check(|| self.reclaim())?;

        let info = self
            .resolve(plugin_id, module_class, Some(version), Capability::Batch)
            .await
            .ok_or_else(|| GsmError::module_not_found(plugin_id.0, module_class))?;
        let unit = self.unit_for(&info).await?;
        let task = unit
            .module(module_class)
            .and_then(|m| m.instance.as_batch())
            .ok_or_else(|| GsmError::module_not_found(plugin_id.0, module_class))?;

        let ctx = unit.context(module_class, &self.location, self.instance_id);
        let label = format!("{}:{}@{}", plugin_id, module_class, version);
        self.invoke(&label, InvocationKind::Event, ctx.clone(), task.run_batch(&ctx))
            .await?;
        debug!(plugin_id = %plugin_id, module_class = %module_class, "Batch module finished");
        Ok(())
    }

    // ═════════════════════════════════════════════════════════════════════════
    // HTTP Processing
    // ═════════════════════════════════════════════════════════════════════════

    /// Route an HTTP request to a web module.
    ///
    /// `path` is tried as a direct module path first, then through the
    /// virtual host table for `host`.
    pub async fn process_http(
        &self,
        host: Option<&str>,
        path: &str,
        mut request: WebRequest,
    ) -> Result<WebResponse> {
        self.memory_guard.check(|| self.reclaim())?;

        let route = match self.route(host, path) {
            Some(route) => route,
            None => return Err(self.no_mapping(path).await),
        };

        let live = self.get_live_module_list(&self.location).await;
        let candidates: Vec<&ModuleInfo> = live
            .iter()
            .filter(|m| {
                m.plugin_id == route.plugin_id
                    && m.version == route.version
                    && m.capabilities.contains(&Capability::Web)
            })
            .collect();
        let info = candidates
            .iter()
            .find(|m| m.path.is_some() && m.path.as_deref() == route.mount())
            .or_else(|| candidates.iter().find(|m| m.path.is_none()))
            .map(|m| (*m).clone());
        let Some(info) = info else {
            return Err(self.no_mapping(path).await);
        };

        let unit = self.unit_for(&info).await?;
        let handler = unit
            .module(&info.implementation_class_name)
            .and_then(|m| m.instance.as_web())
            .ok_or_else(|| GsmError::module_not_found(info.plugin_id.0, &info.implementation_class_name))?;

        request.subpath = route.subpath.clone();
        let ctx = unit.context(&info.implementation_class_name, &self.location, self.instance_id);
        let label = format!("{} {}", request.method, path);
        self.invoke(&label, InvocationKind::Http, ctx.clone(), handler.handle(&ctx, request))
            .await
    }

    /// Resolve a request path to a module route.
    pub fn route(&self, host: Option<&str>, path: &str) -> Option<ModuleRoute> {
        if let Some(route) = parse_module_path(path) {
            return Some(route);
        }
        let mapping = self.vhosts.resolve(host?)?;
        parse_module_path(&routing::join_mapping(&mapping, path))
    }

    /// Every mapping currently served, for "no mapping" responses.
    pub async fn known_mappings(&self) -> Vec<String> {
        let live = self.get_live_module_list(&self.location).await;
        let mut mappings: Vec<String> = live
            .iter()
            .filter(|m| m.capabilities.contains(&Capability::Web))
            .map(|m| {
                let base = base_path(m.plugin_id, m.version);
                match &m.path {
                    Some(p) => format!("{}/{}", base, p.trim_matches('/')),
                    None => base,
                }
            })
            .collect();
        mappings.sort();
        mappings.dedup();

        let hosts = self.vhosts.snapshot();
        let mut aliases: Vec<String> = hosts
            .iter()
            .map(|(host, path)| format!("{} -> {}", host, path))
            .collect();
        aliases.sort();
        mappings.extend(aliases);
        mappings
    }

    async fn no_mapping(&self, path: &str) -> GsmError {
        GsmError::no_module_mapping(path, &self.known_mappings().await)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Virtual Hosts
    // ─────────────────────────────────────────────────────────────────────────

    pub fn virtual_hosts(&self) -> Arc<std::collections::HashMap<String, String>> {
        self.vhosts.snapshot()
    }

    pub async fn reload_virtual_hosts(&self) -> Result<usize> {
        self.vhosts.reload().await
    }

    pub async fn set_virtual_host(&self, host: &str, path: &str) -> Result<()> {
        self.vhosts.set(host, path).await?;
        self.broadcast(&SystemCommand::ReloadVirtualHosts).await;
        Ok(())
    }

    pub async fn remove_virtual_host(&self, host: &str) -> Result<bool> {
        let removed = self.vhosts.remove(host).await?;
        self.broadcast(&SystemCommand::ReloadVirtualHosts).await;
        Ok(removed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fixed Modules
    // ─────────────────────────────────────────────────────────────────────────

    /// Align running fixed tasks with the live fixed modules of this
    /// location; returns how many tasks were started.
    pub async fn start_fixed_modules(&self) -> usize {
        let live = self.get_live_module_list(&self.location).await;
        let wanted: Vec<&ModuleInfo> = live
            .iter()
            .filter(|m| m.capabilities.contains(&Capability::Fixed))
            .collect();

        for key in self.fixed.running() {
            let still_live = wanted
                .iter()
                .any(|m| m.plugin_id == key.plugin_id && m.version == key.version);
            if !still_live {
                self.fixed.stop(key.plugin_id, key.version);
            }
        }

        let mut started = 0;
        for info in wanted {
            let Some(unit) = self.loader.build_isolation_unit(&info.archive_name).await else {
                warn!(archive = %info.archive_name, "Fixed module archive unavailable");
                continue;
            };
            let ctx = unit.context(&info.implementation_class_name, &self.location, self.instance_id);
            if self.fixed.start(unit, ctx) {
                started += 1;
            }
        }
        started
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Module Context
    // ─────────────────────────────────────────────────────────────────────────

    /// Run `body` with the identity of `(plugin_id, version, module_class)`
    /// as the ambient module context.
    pub async fn run_with_module_context<F>(
        &self,
        plugin_id: PluginId,
        version: PluginVersion,
        module_class: &str,
        body: F,
    ) -> Result<F::Output>
    where
        F: Future,
    {
        let rows = self.registry.find(plugin_id, version).await?;
        let info = rows
            .iter()
            .find(|m| m.implementation_class_name == module_class)
            .ok_or_else(|| GsmError::module_not_found(plugin_id.0, module_class))?;
        let unit = self.unit_for(info).await?;
        let ctx = unit.context(module_class, &self.location, self.instance_id);
        Ok(run_with_module_context(ctx, body).await)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    /// Live module for `(plugin_id, class)` with `capability`, preferring
    /// `version` and otherwise the highest live version.
    async fn resolve(
        &self,
        plugin_id: PluginId,
        module_class: &str,
        version: Option<PluginVersion>,
        capability: Capability,
    ) -> Option<ModuleInfo> {
        let live = self.get_live_module_list(&self.location).await;
        let mut matches: Vec<&ModuleInfo> = live
            .iter()
            .filter(|m| {
                m.plugin_id == plugin_id
                    && m.implementation_class_name == module_class
                    && m.capabilities.contains(&capability)
            })
            .collect();
        if let Some(exact) = version.and_then(|v| matches.iter().find(|m| m.version == v)) {
            return Some((*exact).clone());
        }
        matches.sort_by(|a, b| b.version.cmp(&a.version));
        matches.first().map(|m| (*m).clone())
    }

    /// Unit backing a live row; a missing or tampered archive surfaces as
    /// `ArchiveNotFound` or `ChecksumMismatch`.
    async fn unit_for(&self, info: &ModuleInfo) -> Result<Arc<IsolationUnit>> {
        self.loader.load_unit(&info.archive_name).await
    }

    /// Run module code under the timeout guard, the ambient context and a
    /// panic boundary; records monitoring for every outcome.
    async fn invoke<F, T>(
        &self,
        label: &str,
        kind: InvocationKind,
        ctx: ModuleContext,
        work: F,
    ) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, ModuleError>>,
    {
        let started = Instant::now();
        let scoped = AssertUnwindSafe(run_with_module_context(ctx, work)).catch_unwind();
        let outcome = self.timeout_guard.run(label, scoped).await;
        let elapsed = started.elapsed();

        self.monitor.record(kind, elapsed);
        match kind {
            InvocationKind::Http => {
                histogram!("gsm_http_request_duration_seconds").record(elapsed.as_secs_f64())
            }
            InvocationKind::Event => {
                histogram!("gsm_event_duration_seconds").record(elapsed.as_secs_f64())
            }
        }

        let result = match outcome {
            Err(timeout) => Err(timeout),
            Ok(Err(payload)) => Err(GsmError::from(ModuleError::Panicked(panic_message(payload)))),
            Ok(Ok(Err(e))) => Err(GsmError::from(e)),
            Ok(Ok(Ok(value))) => Ok(value),
        };

        let status = if result.is_ok() { "success" } else { "failure" };
        counter!("gsm_messages_processed_total", "kind" => kind.as_str(), "outcome" => status)
            .increment(1);
        if let Err(e) = &result {
            warn!(module = %label, error = %e, "Module invocation failed");
        }
        result
    }

    /// Memory guard's reclaim step: drop loaded units and cached lists.
    fn reclaim(&self) -> usize {
        let purged = self.loader.purge();
        self.registry.invalidate(None);
        purged
    }

    async fn broadcast_invalidation(&self) {
        self.broadcast(&SystemCommand::InvalidateModuleCache { location: None })
            .await;
    }

    /// Best-effort send of a system command on the global queue.
    async fn broadcast(&self, command: &SystemCommand) {
        if let Err(e) = self.try_broadcast(command).await {
            warn!(queue = %self.global_queue, error = %e, "System broadcast failed");
        }
    }

    async fn try_broadcast(&self, command: &SystemCommand) -> Result<()> {
        let message = Message::system(command)?.with_source(self.instance_id, self.location.clone(), None);
        let queue = match self.backend.queue_id(&self.global_queue).await? {
            Some(queue) => queue,
            None => self.backend.define_queue(&self.global_queue).await?,
        };
        self.backend.send_message(&queue, &message.to_json()?).await?;
        Ok(())
    }
}
