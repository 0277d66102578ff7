//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use gsm_core::cloud::{CloudBackend, InMemoryCloud};
use gsm_core::config::PluginConfig;
use gsm_core::manager::{FixedMemoryProbe, PluginManager, RecordingExit};
use gsm_core::message::Message;
use gsm_core::modules::{EventHandler, Module, ModuleCatalog, ModuleContext, ModuleError};

pub const HOME: &str = "home";
pub const SLOW: &str = "test.Slow";
pub const PANICKY: &str = "test.Panicky";

/// Echoes its payload after sleeping `sleep_ms` milliseconds.
pub struct Slow;

#[async_trait]
impl EventHandler for Slow {
    async fn on_message(
        &self,
        _ctx: &ModuleContext,
        message: &Message,
    ) -> Result<Option<serde_json::Value>, ModuleError> {
        if let Some(ms) = message.payload.get("sleep_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        Ok(Some(message.payload.clone()))
    }
}

impl Module for Slow {
    fn as_event(&self) -> Option<&dyn EventHandler> {
        Some(self)
    }
}

pub struct Panicky;

#[async_trait]
impl EventHandler for Panicky {
    async fn on_message(
        &self,
        _ctx: &ModuleContext,
        _message: &Message,
    ) -> Result<Option<serde_json::Value>, ModuleError> {
        panic!("module bug");
    }
}

impl Module for Panicky {
    fn as_event(&self) -> Option<&dyn EventHandler> {
        Some(self)
    }
}

pub fn catalog() -> Arc<ModuleCatalog> {
    let catalog = ModuleCatalog::with_builtins();
    catalog.register(SLOW, |_| Ok(Arc::new(Slow) as Arc<dyn Module>));
    catalog.register(PANICKY, |_| Ok(Arc::new(Panicky) as Arc<dyn Module>));
    Arc::new(catalog)
}

/// TOML manifest exporting `classes`, each with an optional web path.
pub fn manifest(plugin_id: i64, version: f64, name: &str, classes: &[(&str, Option<&str>)]) -> Vec<u8> {
    let mut doc = format!(
        "name = \"{}\"\nplugin_id = {}\nversion = {:?}\n",
        name, plugin_id, version
    );
    for (class, path) in classes {
        doc.push_str(&format!("\n[[modules]]\nclass = \"{}\"\n", class));
        if let Some(path) = path {
            doc.push_str(&format!("path = \"{}\"\n", path));
        }
    }
    doc.into_bytes()
}

pub fn plugin_config() -> PluginConfig {
    PluginConfig {
        invocation_timeout: Duration::from_millis(100),
        max_timeout_count: 3,
        ..PluginConfig::default()
    }
}

pub struct Harness {
    pub cloud: Arc<InMemoryCloud>,
    pub exit: Arc<RecordingExit>,
    pub manager: Arc<PluginManager>,
}

pub fn harness() -> Harness {
    harness_with(plugin_config())
}

pub fn harness_with(config: PluginConfig) -> Harness {
    let cloud = Arc::new(InMemoryCloud::new());
    let exit = Arc::new(RecordingExit::new());
    let manager = PluginManager::new(
        config,
        Uuid::new_v4(),
        HOME,
        cloud.clone() as Arc<dyn CloudBackend>,
        catalog(),
        exit.clone(),
    )
    .expect("manager")
    .with_memory_probe(Arc::new(FixedMemoryProbe::new(u64::MAX)));

    Harness {
        cloud,
        exit,
        manager: Arc::new(manager),
    }
}
