//! Installed module metadata and the per-location live module cache.
//!
//! Metadata rows live in the backend table [`MODULES_TABLE`]. Reads of the
//! live module list are served from a per-location snapshot that is rebuilt
//! once it is older than the configured TTL; a per-location lock keeps the
//! rebuild to one caller at a time.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CapabilitySet, KeyedLocks};
use crate::cloud::{CloudBackend, TableExt};
use crate::error::Result;
use crate::message::{PluginId, PluginVersion};

pub const MODULES_TABLE: &str = "gsm_modules";

// ═══════════════════════════════════════════════════════════════════════════════
// ModuleInfo
// ═══════════════════════════════════════════════════════════════════════════════

/// Persisted metadata of one module class inside an archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
    pub plugin_id: PluginId,
    pub version: PluginVersion,
    pub implementation_class_name: String,
    /// Canonical archive name `pluginId_name-version`
    pub archive_name: String,
    pub display_name: String,
    pub enabled: bool,
    pub capabilities: CapabilitySet,
    pub installed_on: DateTime<Utc>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub locations: Vec<String>,
}

impl ModuleInfo {
    pub fn key(&self) -> String {
        row_key(self.plugin_id, self.version, &self.implementation_class_name)
    }

    pub fn is_live_at(&self, location: &str) -> bool {
        self.enabled && (self.locations.is_empty() || self.locations.iter().any(|l| l == location))
    }
}

fn row_key(plugin_id: PluginId, version: PluginVersion, class: &str) -> String {
    format!("{}:{}:{}", plugin_id, version, class)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Live Module Cache
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ModuleInfoCache {
    pub location: String,
    pub modules: Arc<Vec<ModuleInfo>>,
    pub cached_on: DateTime<Utc>,
}

impl ModuleInfoCache {
    fn is_fresh(&self, ttl: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.cached_on);
        age.to_std().map(|a| a < ttl).unwrap_or(true)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ModuleRegistry {
    backend: Arc<dyn CloudBackend>,
    home_location: String,
    ttl: Duration,
    caches: DashMap<String, ModuleInfoCache>,
    locks: KeyedLocks,
    rebuilds: AtomicU64,
}

impl ModuleRegistry {
    pub fn new(backend: Arc<dyn CloudBackend>, home_location: impl Into<String>, ttl: Duration) -> Self {
        Self {
            backend,
            home_location: home_location.into(),
            ttl,
            caches: DashMap::new(),
            locks: KeyedLocks::default(),
            rebuilds: AtomicU64::new(0),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn record(&self, modules: &[ModuleInfo]) -> Result<()> {
        for info in modules {
            self.backend.save_as(MODULES_TABLE, &info.key(), info).await?;
        }
        self.invalidate(None);
        Ok(())
    }

    pub async fn all(&self) -> Result<Vec<ModuleInfo>> {
        let mut modules: Vec<ModuleInfo> = self.backend.list_as(MODULES_TABLE).await?;
        modules.sort_by(|a, b| {
            (a.plugin_id, a.version, &a.implementation_class_name).cmp(&(
                b.plugin_id,
                b.version,
                &b.implementation_class_name,
            ))
        });
        Ok(modules)
    }

    /// Modules recorded for one archive.
    pub async fn find(&self, plugin_id: PluginId, version: PluginVersion) -> Result<Vec<ModuleInfo>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|m| m.plugin_id == plugin_id && m.version == version)
            .collect())
    }

    /// Remove every row of an archive; returns the removed rows.
    pub async fn remove(&self, plugin_id: PluginId, version: PluginVersion) -> Result<Vec<ModuleInfo>> {
        let rows = self.find(plugin_id, version).await?;
        for info in &rows {
            self.backend.delete_row(MODULES_TABLE, &info.key()).await?;
        }
        if !rows.is_empty() {
            self.invalidate(None);
        }
        Ok(rows)
    }

    /// Flip the enabled flag of an archive's modules; returns the updated rows.
    pub async fn set_enabled(
        &self,
        plugin_id: PluginId,
        version: PluginVersion,
        enabled: bool,
    ) -> Result<Vec<ModuleInfo>> {
        let mut rows = self.find(plugin_id, version).await?;
        for info in rows.iter_mut() {
            info.enabled = enabled;
            self.backend.save_as(MODULES_TABLE, &info.key(), &*info).await?;
        }
        if !rows.is_empty() {
            self.invalidate(None);
        }
        Ok(rows)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Live Module Cache
    // ─────────────────────────────────────────────────────────────────────────

    /// Enabled modules live at `location`.
    ///
    /// Served from the cache while fresh. An unknown location yields an
    /// empty list; a backend failure yields an empty, uncached list.
    pub async fn live_modules(&self, location: &str) -> Arc<Vec<ModuleInfo>> {
        if let Some(modules) = self.fresh(location) {
            return modules;
        }

        let lock = self.locks.lock_for(location);
        let _guard = lock.lock().await;

        if let Some(modules) = self.fresh(location) {
            return modules;
        }

        match self.rebuild(location).await {
            Ok(modules) => {
                let modules = Arc::new(modules);
                self.caches.insert(
                    location.to_string(),
                    ModuleInfoCache {
                        location: location.to_string(),
                        modules: Arc::clone(&modules),
                        cached_on: Utc::now(),
                    },
                );
                modules
            }
            Err(e) => {
                warn!(location = %location, error = %e, "Live module list unavailable");
                Arc::new(Vec::new())
            }
        }
    }

    fn fresh(&self, location: &str) -> Option<Arc<Vec<ModuleInfo>>> {
        self.caches
            .get(location)
            .filter(|c| c.is_fresh(self.ttl))
            .map(|c| Arc::clone(&c.modules))
    }

    async fn rebuild(&self, location: &str) -> Result<Vec<ModuleInfo>> {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        let modules = self.all().await?;

        if !self.is_known_location(location, &modules).await {
            debug!(location = %location, "Unknown location has no live modules");
            return Ok(Vec::new());
        }

        let live: Vec<ModuleInfo> = modules.into_iter().filter(|m| m.is_live_at(location)).collect();
        debug!(location = %location, modules = live.len(), "Live module cache rebuilt");
        Ok(live)
    }

    async fn is_known_location(&self, location: &str, modules: &[ModuleInfo]) -> bool {
        if location == self.home_location {
            return true;
        }
        if modules.iter().any(|m| m.locations.iter().any(|l| l == location)) {
            return true;
        }
        match self.backend.locations().await {
            Ok(known) => known.iter().any(|l| l == location),
            Err(e) => {
                warn!(error = %e, "Failed to list fleet locations");
                false
            }
        }
    }

    /// Drop the snapshot of one location, or of all of them.
    pub fn invalidate(&self, location: Option<&str>) {
        match location {
            Some(l) => {
                self.caches.remove(l);
            }
            None => self.caches.clear(),
        }
    }

    /// Shift a snapshot's timestamp into the past.
    pub fn age_cache(&self, location: &str, by: Duration) {
        if let Some(mut cache) = self.caches.get_mut(location) {
            let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
            cache.cached_on = cache.cached_on - by;
        }
    }

    pub fn cache_snapshot(&self, location: &str) -> Option<ModuleInfoCache> {
        self.caches.get(location).map(|c| c.clone())
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::InMemoryCloud;
    use crate::modules::Capability;

    fn info(plugin_id: i64, class: &str, locations: &[&str]) -> ModuleInfo {
        ModuleInfo {
            plugin_id: PluginId(plugin_id),
            version: PluginVersion(1.0),
            implementation_class_name: class.into(),
            archive_name: format!("{}_demo-1.0", plugin_id),
            display_name: "demo".into(),
            enabled: true,
            capabilities: [Capability::Event].into_iter().collect(),
            installed_on: Utc::now(),
            path: None,
            locations: locations.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn registry(cloud: &Arc<InMemoryCloud>) -> ModuleRegistry {
        ModuleRegistry::new(cloud.clone() as Arc<dyn CloudBackend>, "home", Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_live_modules_filtered_by_location() {
        let cloud = Arc::new(InMemoryCloud::new());
        let registry = registry(&cloud);
        registry
            .record(&[info(1, "a.Everywhere", &[]), info(2, "b.EuOnly", &["eu"])])
            .await
            .unwrap();

        assert_eq!(registry.live_modules("home").await.len(), 1);
        assert_eq!(registry.live_modules("eu").await.len(), 2);
        assert!(registry.live_modules("nowhere").await.is_empty());
    }

    #[tokio::test]
    async fn test_cache_served_without_backend_reads() {
        let cloud = Arc::new(InMemoryCloud::new());
        let registry = registry(&cloud);
        registry.record(&[info(1, "a.Module", &[])]).await.unwrap();

        let first = registry.live_modules("home").await;
        let reads = cloud.table_reads();
        let second = registry.live_modules("home").await;

        assert_eq!(first, second);
        assert_eq!(cloud.table_reads(), reads);
        assert_eq!(registry.rebuild_count(), 1);
    }

    #[tokio::test]
    async fn test_disabled_modules_are_not_live() {
        let cloud = Arc::new(InMemoryCloud::new());
        let registry = registry(&cloud);
        registry.record(&[info(1, "a.Module", &[])]).await.unwrap();

        registry.set_enabled(PluginId(1), PluginVersion(1.0), false).await.unwrap();
        assert!(registry.live_modules("home").await.is_empty());

        registry.set_enabled(PluginId(1), PluginVersion(1.0), true).await.unwrap();
        assert_eq!(registry.live_modules("home").await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_unknown_archive_is_noop() {
        let cloud = Arc::new(InMemoryCloud::new());
        let registry = registry(&cloud);
        assert!(registry.remove(PluginId(9), PluginVersion(1.0)).await.unwrap().is_empty());
    }
}
