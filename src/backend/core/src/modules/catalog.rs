//! Module factories registered by implementation class name.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::{builtin, Module, ModuleDeclaration, ModuleError};

/// Builds a fresh module instance from its declaration.
pub type ModuleFactory =
    Arc<dyn Fn(&ModuleDeclaration) -> Result<Arc<dyn Module>, ModuleError> + Send + Sync>;

/// Extract a human-readable message from a panic payload.
pub fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

/// The set of module classes this runtime can instantiate.
#[derive(Default)]
pub struct ModuleCatalog {
    factories: RwLock<HashMap<String, ModuleFactory>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog preloaded with the `gsm.builtin.*` modules.
    pub fn with_builtins() -> Self {
        let catalog = Self::new();
        builtin::register_all(&catalog);
        catalog
    }

    pub fn register<F>(&self, class: impl Into<String>, factory: F)
    where
        F: Fn(&ModuleDeclaration) -> Result<Arc<dyn Module>, ModuleError> + Send + Sync + 'static,
    {
        let class = class.into();
        tracing::debug!(module_class = %class, "Module class registered");
        self.factories.write().insert(class, Arc::new(factory));
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.read().contains_key(class)
    }

    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.factories.read().keys().cloned().collect();
        classes.sort();
        classes
    }

    /// Build one instance, turning a factory panic into an error.
    pub fn instantiate(&self, declaration: &ModuleDeclaration) -> Result<Arc<dyn Module>, ModuleError> {
        let factory = self
            .factories
            .read()
            .get(&declaration.class)
            .cloned()
            .ok_or_else(|| {
                ModuleError::NotSupported(format!("unknown module class {}", declaration.class))
            })?;

        match catch_unwind(AssertUnwindSafe(|| factory(declaration))) {
            Ok(result) => result,
            Err(payload) => Err(ModuleError::Panicked(panic_message(payload))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(class: &str) -> ModuleDeclaration {
        ModuleDeclaration {
            class: class.into(),
            path: None,
            locations: vec![],
            config: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_builtins_registered() {
        let catalog = ModuleCatalog::with_builtins();
        assert!(catalog.contains(builtin::ECHO));
        assert!(catalog.instantiate(&decl(builtin::ECHO)).is_ok());
    }

    #[test]
    fn test_unknown_class() {
        let catalog = ModuleCatalog::new();
        let err = catalog.instantiate(&decl("com.acme.Missing")).err().unwrap();
        assert!(matches!(err, ModuleError::NotSupported(_)));
    }

    #[test]
    fn test_panicking_factory_is_contained() {
        let catalog = ModuleCatalog::new();
        catalog.register("com.acme.Broken", |_| panic!("static initializer failed"));

        let err = catalog.instantiate(&decl("com.acme.Broken")).err().unwrap();
        match err {
            ModuleError::Panicked(msg) => assert!(msg.contains("static initializer")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
