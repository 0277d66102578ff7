//! Module identity, configuration and private state.
//!
//! Every invocation receives a [`ModuleContext`] explicitly. Code that
//! cannot take it as an argument reads the ambient one through
//! [`current_module`] inside [`run_with_module_context`]; the previous
//! ambient context is restored when the scope ends, including on panic.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::message::{PluginId, PluginVersion};

tokio::task_local! {
    static CURRENT_MODULE: ModuleContext;
}

// ═══════════════════════════════════════════════════════════════════════════════
// State Arena
// ═══════════════════════════════════════════════════════════════════════════════

/// State private to one `(pluginId, version)` isolation unit.
///
/// Two versions of the same plugin never share an arena.
#[derive(Debug, Default)]
pub struct ModuleState {
    values: DashMap<String, serde_json::Value>,
}

impl ModuleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.values.get(key).map(|v| v.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    /// Add one to an integer counter and return the new value.
    pub fn increment(&self, key: &str) -> i64 {
        let mut entry = self
            .values
            .entry(key.to_string())
            .or_insert(serde_json::json!(0));
        let next = entry.as_i64().unwrap_or(0) + 1;
        *entry = serde_json::json!(next);
        next
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Context
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub plugin_id: PluginId,
    pub version: PluginVersion,
    pub module_class: String,
    pub location: String,
    pub instance_id: Uuid,
    configuration: Arc<serde_json::Value>,
    state: Arc<ModuleState>,
}

impl ModuleContext {
    pub fn new(
        plugin_id: PluginId,
        version: PluginVersion,
        module_class: impl Into<String>,
        location: impl Into<String>,
        instance_id: Uuid,
    ) -> Self {
        Self {
            plugin_id,
            version,
            module_class: module_class.into(),
            location: location.into(),
            instance_id,
            configuration: Arc::new(serde_json::Value::Null),
            state: Arc::new(ModuleState::new()),
        }
    }

    pub fn with_configuration(mut self, configuration: Arc<serde_json::Value>) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_state(mut self, state: Arc<ModuleState>) -> Self {
        self.state = state;
        self
    }

    pub fn configuration(&self) -> &serde_json::Value {
        &self.configuration
    }

    /// Configuration value under `key`, if set.
    pub fn config_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.configuration.get(key)
    }

    pub fn state(&self) -> &ModuleState {
        &self.state
    }

    pub fn shares_state_with(&self, other: &ModuleContext) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Ambient Scope
// ═══════════════════════════════════════════════════════════════════════════════

/// Run `body` with `ctx` as the ambient module context.
pub async fn run_with_module_context<F>(ctx: ModuleContext, body: F) -> F::Output
where
    F: Future,
{
    CURRENT_MODULE.scope(ctx, body).await
}

/// The ambient module context, when called inside [`run_with_module_context`].
pub fn current_module() -> Option<ModuleContext> {
    CURRENT_MODULE.try_with(|ctx| ctx.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(class: &str) -> ModuleContext {
        ModuleContext::new(PluginId(1), PluginVersion(1.0), class, "lab", Uuid::nil())
    }

    #[tokio::test]
    async fn test_nested_scopes_restore_outer() {
        assert!(current_module().is_none());

        run_with_module_context(ctx("outer"), async {
            assert_eq!(current_module().unwrap().module_class, "outer");

            run_with_module_context(ctx("inner"), async {
                assert_eq!(current_module().unwrap().module_class, "inner");
            })
            .await;

            assert_eq!(current_module().unwrap().module_class, "outer");
        })
        .await;

        assert!(current_module().is_none());
    }

    #[tokio::test]
    async fn test_scope_restored_after_error() {
        let result: Result<(), &str> = run_with_module_context(ctx("failing"), async {
            assert!(current_module().is_some());
            Err("boom")
        })
        .await;

        assert!(result.is_err());
        assert!(current_module().is_none());
    }

    #[tokio::test]
    async fn test_scope_restored_after_panic() {
        let handle = tokio::spawn(async {
            let outcome = futures::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(
                run_with_module_context(ctx("panicky"), async {
                    panic!("module defect");
                }),
            ))
            .await;
            assert!(outcome.is_err());
            current_module().is_none()
        });
        assert!(handle.await.unwrap());
    }

    #[test]
    fn test_state_increment() {
        let state = ModuleState::new();
        assert_eq!(state.increment("runs"), 1);
        assert_eq!(state.increment("runs"), 2);
        assert_eq!(state.get("runs"), Some(serde_json::json!(2)));
    }
}
