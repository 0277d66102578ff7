//! # Modules
//!
//! Application logic deployed into the runtime.
//!
//! ## Architecture
//!
//! - **Capabilities**: a module implements any of [`EventHandler`],
//!   [`BatchTask`], [`FixedTask`] and [`WebHandler`]; [`Module`] exposes
//!   them through accessors so capabilities come from the implementation.
//! - **Manifest**: an uploaded archive is a manifest naming the module
//!   classes it exports, with per-module configuration.
//! - **Catalog**: explicit registration of module factories by class name.
//! - **Loader**: turns an archive into an isolation unit, one per
//!   `(pluginId, version)`, each with its own state arena.
//! - **Registry**: persisted module metadata and the per-location live
//!   module cache.
//! - **Context**: identity and state handed to every invocation.

pub mod builtin;
pub mod catalog;
pub mod context;
pub mod loader;
pub mod manifest;
pub mod registry;

pub use catalog::ModuleCatalog;
pub use context::{current_module, run_with_module_context, ModuleContext, ModuleState};
pub use loader::{IsolationUnit, LoadedModule, ModuleLoader};
pub use manifest::{ArchiveManifest, ModuleDeclaration};
pub use registry::{ModuleInfo, ModuleRegistry};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::message::{Message, PluginId, PluginVersion};

// ═══════════════════════════════════════════════════════════════════════════════
// Capabilities
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Batch,
    Fixed,
    Event,
    Web,
}

pub type CapabilitySet = BTreeSet<Capability>;

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors raised by module code.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("Module failed: {0}")]
    Failed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Module panicked: {0}")]
    Panicked(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Capability Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// Handles module-addressed queue messages.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Returns the reply payload, or `None` for fire-and-forget messages.
    async fn on_message(
        &self,
        ctx: &ModuleContext,
        message: &Message,
    ) -> Result<Option<serde_json::Value>, ModuleError>;
}

/// Work run periodically, at most once per window per location.
#[async_trait]
pub trait BatchTask: Send + Sync {
    async fn run_batch(&self, ctx: &ModuleContext) -> Result<(), ModuleError>;
}

/// Long-lived work running for the lifetime of the hosting instance.
#[async_trait]
pub trait FixedTask: Send + Sync {
    /// Must return promptly once `shutdown` is cancelled.
    async fn run(&self, ctx: &ModuleContext, shutdown: CancellationToken) -> Result<(), ModuleError>;
}

#[async_trait]
pub trait WebHandler: Send + Sync {
    async fn handle(&self, ctx: &ModuleContext, request: WebRequest) -> Result<WebResponse, ModuleError>;
}

/// A deployable module implementation.
pub trait Module: Send + Sync + 'static {
    fn as_event(&self) -> Option<&dyn EventHandler> {
        None
    }

    fn as_batch(&self) -> Option<&dyn BatchTask> {
        None
    }

    fn as_fixed(&self) -> Option<&dyn FixedTask> {
        None
    }

    fn as_web(&self) -> Option<&dyn WebHandler> {
        None
    }

    fn capabilities(&self) -> CapabilitySet {
        let mut caps = CapabilitySet::new();
        if self.as_event().is_some() {
            caps.insert(Capability::Event);
        }
        if self.as_batch().is_some() {
            caps.insert(Capability::Batch);
        }
        if self.as_fixed().is_some() {
            caps.insert(Capability::Fixed);
        }
        if self.as_web().is_some() {
            caps.insert(Capability::Web);
        }
        caps
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Web I/O Types
// ═══════════════════════════════════════════════════════════════════════════════

/// HTTP request routed to a web module.
#[derive(Debug, Clone)]
pub struct WebRequest {
    pub method: Method,
    /// Path below the module's mapping, always starting with `/`
    pub subpath: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct WebResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Bytes,
}

impl WebResponse {
    pub fn json(value: &serde_json::Value) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/json".into(),
            body: Bytes::from(value.to_string()),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "text/plain; charset=utf-8".into(),
            body: Bytes::from(body.into()),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Naming
// ═══════════════════════════════════════════════════════════════════════════════

/// Canonical archive name `pluginId_name-version`.
pub fn archive_name(plugin_id: PluginId, name: &str, version: PluginVersion) -> String {
    let slug: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("{}_{}-{}", plugin_id, slug, version)
}

/// Base HTTP path of a plugin version, e.g. `/1/v1.0`.
pub fn base_path(plugin_id: PluginId, version: PluginVersion) -> String {
    format!("/{}/v{}", plugin_id, version)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Keyed Locks
// ═══════════════════════════════════════════════════════════════════════════════

/// One async mutex per key, so rebuilds of different keys never contend.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl KeyedLocks {
    pub(crate) fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.entry(key.to_string()).or_default().value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EventOnly;

    #[async_trait]
    impl EventHandler for EventOnly {
        async fn on_message(
            &self,
            _ctx: &ModuleContext,
            _message: &Message,
        ) -> Result<Option<serde_json::Value>, ModuleError> {
            Ok(None)
        }
    }

    impl Module for EventOnly {
        fn as_event(&self) -> Option<&dyn EventHandler> {
            Some(self)
        }
    }

    #[test]
    fn test_capabilities_follow_implementation() {
        let caps = EventOnly.capabilities();
        assert_eq!(caps.len(), 1);
        assert!(caps.contains(&Capability::Event));
    }

    #[test]
    fn test_archive_name() {
        assert_eq!(
            archive_name(PluginId(101), "Order Book", PluginVersion(1.0)),
            "101_order-book-1.0"
        );
        assert_eq!(base_path(PluginId(1), PluginVersion(1.0)), "/1/v1.0");
    }
}
