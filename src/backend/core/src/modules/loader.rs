//! Turns uploaded archives into isolation units.
//!
//! A unit is built once per archive content checksum. Archives whose
//! checksum previously produced no usable module are remembered so they are
//! not downloaded again until their content changes.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    ArchiveManifest, CapabilitySet, KeyedLocks, Module, ModuleCatalog, ModuleContext,
    ModuleDeclaration, ModuleState,
};
use crate::cloud::{archive_checksum, CloudBackend};
use crate::error::{GsmError, Result};
use crate::message::{PluginId, PluginVersion};

// ═══════════════════════════════════════════════════════════════════════════════
// Isolation Unit
// ═══════════════════════════════════════════════════════════════════════════════

/// One module instance inside a unit.
pub struct LoadedModule {
    pub declaration: ModuleDeclaration,
    pub instance: Arc<dyn Module>,
    pub capabilities: CapabilitySet,
}

/// Everything loaded for one `(pluginId, version)`.
pub struct IsolationUnit {
    pub archive: String,
    pub plugin_id: PluginId,
    pub version: PluginVersion,
    pub checksum: String,
    pub manifest: ArchiveManifest,
    pub modules: Vec<LoadedModule>,
    configuration: Arc<serde_json::Value>,
    state: Arc<ModuleState>,
}

impl IsolationUnit {
    pub fn type_names(&self) -> Vec<String> {
        self.modules
            .iter()
            .map(|m| m.declaration.class.clone())
            .collect()
    }

    pub fn module(&self, class: &str) -> Option<&LoadedModule> {
        self.modules.iter().find(|m| m.declaration.class == class)
    }

    pub fn state(&self) -> &Arc<ModuleState> {
        &self.state
    }

    /// Context for invoking `class` from this unit.
    pub fn context(&self, class: &str, location: &str, instance_id: uuid::Uuid) -> ModuleContext {
        let configuration = match self.configuration.as_ref() {
            serde_json::Value::Null => self
                .module(class)
                .map(|m| Arc::new(m.declaration.config.clone()))
                .unwrap_or_else(|| Arc::clone(&self.configuration)),
            _ => Arc::clone(&self.configuration),
        };

        ModuleContext::new(self.plugin_id, self.version, class, location, instance_id)
            .with_configuration(configuration)
            .with_state(Arc::clone(&self.state))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Loader
// ═══════════════════════════════════════════════════════════════════════════════

/// Why an archive's current content cannot be used.
#[derive(Debug, Clone)]
enum BuildFailure {
    Corrupt(String),
    Checksum { expected: String, actual: String },
}

impl BuildFailure {
    fn to_error(&self, archive: &str) -> GsmError {
        match self {
            Self::Corrupt(reason) => GsmError::archive_corrupt(archive, reason.clone()),
            Self::Checksum { expected, actual } => GsmError::checksum_mismatch(archive, expected, actual),
        }
    }
}

enum BuildOutcome {
    Built(IsolationUnit),
    /// Content is unusable until it changes
    Failed(BuildFailure),
    /// Transient; retried on the next request
    Unavailable(GsmError),
}

pub struct ModuleLoader {
    backend: Arc<dyn CloudBackend>,
    catalog: Arc<ModuleCatalog>,
    units: DashMap<String, Arc<IsolationUnit>>,
    /// archive -> checksum and cause of a build that produced nothing
    failed: DashMap<String, (String, BuildFailure)>,
    locks: KeyedLocks,
    builds: AtomicU64,
}

impl ModuleLoader {
    pub fn new(backend: Arc<dyn CloudBackend>, catalog: Arc<ModuleCatalog>) -> Self {
        Self {
            backend,
            catalog,
            units: DashMap::new(),
            failed: DashMap::new(),
            locks: KeyedLocks::default(),
            builds: AtomicU64::new(0),
        }
    }

    pub fn catalog(&self) -> &Arc<ModuleCatalog> {
        &self.catalog
    }

    /// Module classes exported by `archive`.
    ///
    /// Empty means "currently unavailable": the archive may be missing,
    /// corrupt, or the backend may have failed.
    pub async fn list_module_types(&self, archive: &str) -> Vec<String> {
        match self.build_isolation_unit(archive).await {
            Some(unit) => unit.type_names(),
            None => Vec::new(),
        }
    }

    /// Unit for `archive`, or `None` when it cannot be loaded right now.
    pub async fn build_isolation_unit(&self, archive: &str) -> Option<Arc<IsolationUnit>> {
        self.load_unit(archive).await.ok()
    }

    /// Unit for `archive`, building it when its content changed.
    ///
    /// Fails without downloading when the stored checksum matches a build
    /// that previously failed or produced no modules.
    pub async fn load_unit(&self, archive: &str) -> Result<Arc<IsolationUnit>> {
        let checksum = match self.backend.module_checksum(archive).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                debug!(archive = %archive, "Archive not found");
                return Err(GsmError::archive_not_found(archive));
            }
            Err(e) => {
                warn!(archive = %archive, error = %e, "Failed to read archive checksum");
                return Err(e.into());
            }
        };

        if let Some(unit) = self.cached(archive, &checksum) {
            return Ok(unit);
        }
        if let Some(failure) = self.known_failure(archive, &checksum) {
            debug!(archive = %archive, "Skipping archive whose last build failed");
            return Err(failure.to_error(archive));
        }

        let lock = self.locks.lock_for(archive);
        let _guard = lock.lock().await;

        if let Some(unit) = self.cached(archive, &checksum) {
            return Ok(unit);
        }

        match self.build(archive, &checksum).await {
            BuildOutcome::Built(unit) => {
                let unit = Arc::new(unit);
                self.units.insert(archive.to_string(), Arc::clone(&unit));
                self.failed.remove(archive);
                Ok(unit)
            }
            BuildOutcome::Failed(failure) => {
                let error = failure.to_error(archive);
                self.failed.insert(archive.to_string(), (checksum, failure));
                self.units.remove(archive);
                Err(error)
            }
            BuildOutcome::Unavailable(error) => Err(error),
        }
    }

    fn known_failure(&self, archive: &str, checksum: &str) -> Option<BuildFailure> {
        self.failed
            .get(archive)
            .filter(|f| f.0 == checksum)
            .map(|f| f.1.clone())
    }

    fn cached(&self, archive: &str, checksum: &str) -> Option<Arc<IsolationUnit>> {
        self.units
            .get(archive)
            .filter(|u| u.checksum == checksum)
            .map(|u| Arc::clone(u.value()))
    }

    async fn build(&self, archive: &str, checksum: &str) -> BuildOutcome {
        let bytes = match self.backend.get_module(archive).await {
            Ok(Some(b)) => b,
            Ok(None) => {
                warn!(archive = %archive, "Archive vanished between checksum and download");
                return BuildOutcome::Unavailable(GsmError::archive_not_found(archive));
            }
            Err(e) => {
                warn!(archive = %archive, error = %e, "Failed to download archive");
                return BuildOutcome::Unavailable(e.into());
            }
        };

        let actual = archive_checksum(&bytes);
        if actual != checksum {
            warn!(archive = %archive, expected = %checksum, actual = %actual, "Archive checksum mismatch");
            return BuildOutcome::Failed(BuildFailure::Checksum {
                expected: checksum.to_string(),
                actual,
            });
        }

        let manifest = match ArchiveManifest::from_bytes(&bytes).and_then(|m| m.validate().map(|_| m)) {
            Ok(m) => m,
            Err(e) => {
                warn!(archive = %archive, error = %e, "Archive is corrupt");
                return BuildOutcome::Failed(BuildFailure::Corrupt(e.to_string()));
            }
        };

        let (plugin_id, version) = match parse_archive_identity(archive) {
            Some(identity) => identity,
            None => {
                warn!(archive = %archive, "Archive name does not follow pluginId_name-version");
                return BuildOutcome::Failed(BuildFailure::Corrupt(
                    "archive name does not follow pluginId_name-version".into(),
                ));
            }
        };

        let mut modules = Vec::with_capacity(manifest.modules.len());
        for declaration in &manifest.modules {
            match self.catalog.instantiate(declaration) {
                Ok(instance) => {
                    let capabilities = instance.capabilities();
                    modules.push(LoadedModule {
                        declaration: declaration.clone(),
                        instance,
                        capabilities,
                    });
                }
                Err(e) => {
                    warn!(
                        archive = %archive,
                        module_class = %declaration.class,
                        error = %e,
                        "Skipping module type that failed to instantiate"
                    );
                }
            }
        }

        if modules.is_empty() {
            warn!(archive = %archive, "Archive produced no loadable modules");
            return BuildOutcome::Failed(BuildFailure::Corrupt(
                "no module in the archive could be instantiated".into(),
            ));
        }

        let configuration = match self.backend.module_configuration(archive).await {
            Ok(c) => c.unwrap_or(serde_json::Value::Null),
            Err(e) => {
                warn!(archive = %archive, error = %e, "Failed to read module configuration");
                serde_json::Value::Null
            }
        };

        self.builds.fetch_add(1, Ordering::Relaxed);
        info!(
            archive = %archive,
            plugin_id = %plugin_id,
            version = %version,
            modules = modules.len(),
            "Isolation unit built"
        );

        BuildOutcome::Built(IsolationUnit {
            archive: archive.to_string(),
            plugin_id,
            version,
            checksum: checksum.to_string(),
            manifest,
            modules,
            configuration: Arc::new(configuration),
            state: Arc::new(ModuleState::new()),
        })
    }

    /// Forget the unit and any failed-build record for `archive`.
    pub fn invalidate(&self, archive: &str) {
        self.units.remove(archive);
        self.failed.remove(archive);
    }

    /// Drop every loaded unit; returns how many were dropped.
    pub fn purge(&self) -> usize {
        let count = self.units.len();
        self.units.clear();
        count
    }

    pub fn loaded_units(&self) -> usize {
        self.units.len()
    }

    pub fn total_builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }
}

/// Split `pluginId_name-version` into its plugin id and version.
pub fn parse_archive_identity(archive: &str) -> Option<(PluginId, PluginVersion)> {
    let (id, rest) = archive.split_once('_')?;
    let (_, version) = rest.rsplit_once('-')?;
    let plugin_id = id.parse::<i64>().ok()?;
    let version = version.parse::<PluginVersion>().ok()?;
    Some((PluginId(plugin_id), version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{InMemoryCloud, ModuleStore};
    use crate::modules::builtin;

    const ARCHIVE: &str = "101_orders-1.0";

    fn manifest(classes: &[&str]) -> Vec<u8> {
        let mut doc = String::from("name = \"orders\"\n");
        for class in classes {
            doc.push_str(&format!("\n[[modules]]\nclass = \"{}\"\n", class));
        }
        doc.into_bytes()
    }

    fn loader(cloud: &Arc<InMemoryCloud>) -> ModuleLoader {
        let catalog = ModuleCatalog::with_builtins();
        catalog.register("com.acme.Broken", |_| panic!("bad static init"));
        ModuleLoader::new(cloud.clone() as Arc<dyn CloudBackend>, Arc::new(catalog))
    }

    #[test]
    fn test_parse_archive_identity() {
        assert_eq!(
            parse_archive_identity("101_order-book-2.5"),
            Some((PluginId(101), PluginVersion(2.5)))
        );
        assert_eq!(parse_archive_identity("garbage"), None);
    }

    #[tokio::test]
    async fn test_missing_archive_lists_nothing() {
        let cloud = Arc::new(InMemoryCloud::new());
        assert!(loader(&cloud).list_module_types(ARCHIVE).await.is_empty());
    }

    #[tokio::test]
    async fn test_broken_type_does_not_abort_archive() {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud
            .upload_module(ARCHIVE, manifest(&[builtin::ECHO, "com.acme.Broken", builtin::COUNTER]))
            .await
            .unwrap();

        let types = loader(&cloud).list_module_types(ARCHIVE).await;
        assert_eq!(types, vec![builtin::ECHO.to_string(), builtin::COUNTER.to_string()]);
    }

    #[tokio::test]
    async fn test_failed_build_is_not_downloaded_again() {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.upload_module(ARCHIVE, b"not = [toml".to_vec()).await.unwrap();
        let loader = loader(&cloud);

        assert!(loader.build_isolation_unit(ARCHIVE).await.is_none());
        assert_eq!(cloud.module_downloads(), 1);

        assert!(loader.build_isolation_unit(ARCHIVE).await.is_none());
        assert_eq!(cloud.module_downloads(), 1);

        cloud.upload_module(ARCHIVE, manifest(&[builtin::ECHO])).await.unwrap();
        assert!(loader.build_isolation_unit(ARCHIVE).await.is_some());
        assert_eq!(cloud.module_downloads(), 2);
    }

    #[tokio::test]
    async fn test_load_unit_reports_why_archive_is_unusable() {
        use crate::error::ErrorCode;

        let cloud = Arc::new(InMemoryCloud::new());
        let loader = loader(&cloud);
        let missing = loader.load_unit(ARCHIVE).await.err().unwrap();
        assert_eq!(missing.code(), ErrorCode::ArchiveNotFound);

        cloud.upload_module(ARCHIVE, manifest(&["com.example.Missing"])).await.unwrap();
        let corrupt = loader.load_unit(ARCHIVE).await.err().unwrap();
        assert_eq!(corrupt.code(), ErrorCode::ArchiveCorrupt);

        cloud.upload_module(ARCHIVE, manifest(&[builtin::ECHO])).await.unwrap();
        cloud.tamper_module(ARCHIVE, manifest(&[builtin::COUNTER]));
        let tampered = loader.load_unit(ARCHIVE).await.err().unwrap();
        assert_eq!(tampered.code(), ErrorCode::ChecksumMismatch);

        let downloads = cloud.module_downloads();
        let again = loader.load_unit(ARCHIVE).await.err().unwrap();
        assert_eq!(again.code(), ErrorCode::ChecksumMismatch);
        assert_eq!(cloud.module_downloads(), downloads);
    }

    #[tokio::test]
    async fn test_unit_cached_by_checksum() {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.upload_module(ARCHIVE, manifest(&[builtin::ECHO])).await.unwrap();
        let loader = loader(&cloud);

        let first = loader.build_isolation_unit(ARCHIVE).await.unwrap();
        let second = loader.build_isolation_unit(ARCHIVE).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.total_builds(), 1);
    }

    #[tokio::test]
    async fn test_versions_do_not_share_state() {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.upload_module("7_counter-1.0", manifest(&[builtin::COUNTER])).await.unwrap();
        cloud.upload_module("7_counter-2.0", manifest(&[builtin::COUNTER])).await.unwrap();
        let loader = loader(&cloud);

        let v1 = loader.build_isolation_unit("7_counter-1.0").await.unwrap();
        let v2 = loader.build_isolation_unit("7_counter-2.0").await.unwrap();

        let ctx1 = v1.context(builtin::COUNTER, "lab", uuid::Uuid::nil());
        let ctx2 = v2.context(builtin::COUNTER, "lab", uuid::Uuid::nil());
        ctx1.state().increment("messages");

        assert!(!ctx1.shares_state_with(&ctx2));
        assert!(ctx2.state().get("messages").is_none());
        assert_eq!(ctx2.version, PluginVersion(2.0));
    }
}
