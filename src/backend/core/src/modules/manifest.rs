//! Archive manifest parsing and validation.
//!
//! An uploaded archive is a manifest document, TOML or JSON, declaring the
//! module classes it exports. The classes themselves are resolved through
//! the [`ModuleCatalog`](super::ModuleCatalog).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ═══════════════════════════════════════════════════════════════════════════════
// Declarations
// ═══════════════════════════════════════════════════════════════════════════════

/// One module exported by an archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDeclaration {
    /// Implementation class name registered in the catalog.
    pub class: String,

    /// First path segment a web module answers to below its base path.
    #[serde(default)]
    pub path: Option<String>,

    /// Locations the module is live at; empty means everywhere.
    #[serde(default)]
    pub locations: Vec<String>,

    /// Configuration handed to the module factory.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ArchiveManifest
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub name: String,

    /// Must match the plugin id given at install time when present.
    #[serde(default)]
    pub plugin_id: Option<i64>,

    #[serde(default)]
    pub version: Option<f64>,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub modules: Vec<ModuleDeclaration>,
}

impl ArchiveManifest {
    // ─────────────────────────────────────────────────────────────────────────
    // Parsing helpers
    // ─────────────────────────────────────────────────────────────────────────

    pub fn from_toml(toml_str: &str) -> Result<Self, ManifestError> {
        toml::from_str(toml_str).map_err(|e| ManifestError::ParseError {
            format: "TOML".into(),
            details: e.to_string(),
        })
    }

    pub fn from_json(json_str: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(json_str).map_err(|e| ManifestError::ParseError {
            format: "JSON".into(),
            details: e.to_string(),
        })
    }

    /// Parse raw archive bytes, picking JSON when the document opens with `{`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ManifestError> {
        let text = std::str::from_utf8(bytes).map_err(|e| ManifestError::ParseError {
            format: "UTF-8".into(),
            details: e.to_string(),
        })?;

        if text.trim_start().starts_with('{') {
            Self::from_json(text)
        } else {
            Self::from_toml(text)
        }
    }

    pub fn to_toml(&self) -> Result<String, ManifestError> {
        toml::to_string(self).map_err(|e| ManifestError::ParseError {
            format: "TOML".into(),
            details: e.to_string(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.name.trim().is_empty() {
            return Err(ManifestError::ValidationError("name must not be empty".into()));
        }

        if let Some(id) = self.plugin_id {
            if id <= 0 {
                return Err(ManifestError::ValidationError(
                    "plugin_id must be positive".into(),
                ));
            }
        }

        if let Some(version) = self.version {
            if !version.is_finite() || version <= 0.0 {
                return Err(ManifestError::ValidationError(
                    "version must be a positive number".into(),
                ));
            }
        }

        if self.modules.is_empty() {
            return Err(ManifestError::ValidationError(
                "archive must declare at least one module".into(),
            ));
        }

        let mut seen = HashSet::new();
        for module in &self.modules {
            if module.class.trim().is_empty() {
                return Err(ManifestError::ValidationError(
                    "module class must not be empty".into(),
                ));
            }
            if !seen.insert(module.class.as_str()) {
                return Err(ManifestError::ValidationError(format!(
                    "module class declared twice: {}",
                    module.class
                )));
            }
        }

        Ok(())
    }

    /// Check the manifest against the identity supplied at install time.
    pub fn check_identity(&self, plugin_id: i64, version: f64) -> Result<(), ManifestError> {
        if let Some(id) = self.plugin_id {
            if id != plugin_id {
                return Err(ManifestError::ValidationError(format!(
                    "manifest plugin_id {} does not match {}",
                    id, plugin_id
                )));
            }
        }
        if let Some(v) = self.version {
            if v != version {
                return Err(ManifestError::ValidationError(format!(
                    "manifest version {} does not match {}",
                    v, version
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to parse {format} manifest: {details}")]
    ParseError { format: String, details: String },

    #[error("Manifest validation error: {0}")]
    ValidationError(String),
}

impl From<ManifestError> for crate::error::GsmError {
    fn from(e: ManifestError) -> Self {
        crate::error::GsmError::invalid_manifest(e.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_manifest() {
        let toml = r#"
name = "orders"
plugin_id = 101
version = 1.0

[[modules]]
class = "gsm.builtin.Echo"

[[modules]]
class = "gsm.builtin.Hello"
path = "test"
locations = ["eu-west"]

[modules.config]
greeting = "hej"
"#;
        let manifest = ArchiveManifest::from_bytes(toml.as_bytes()).unwrap();
        assert_eq!(manifest.name, "orders");
        assert_eq!(manifest.modules.len(), 2);
        assert_eq!(manifest.modules[1].path.as_deref(), Some("test"));
        assert_eq!(manifest.modules[1].config["greeting"], "hej");
        assert!(manifest.validate().is_ok());
        assert!(manifest.check_identity(101, 1.0).is_ok());
        assert!(manifest.check_identity(101, 2.0).is_err());
    }

    #[test]
    fn test_parse_json_manifest() {
        let json = r#"{ "name": "json-archive", "modules": [{ "class": "gsm.builtin.Echo" }] }"#;
        let manifest = ArchiveManifest::from_bytes(json.as_bytes()).unwrap();
        assert_eq!(manifest.name, "json-archive");
        assert!(manifest.modules[0].locations.is_empty());
    }

    #[test]
    fn test_validate_requires_modules() {
        let manifest = ArchiveManifest {
            name: "empty".into(),
            plugin_id: None,
            version: None,
            description: String::new(),
            modules: vec![],
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_class() {
        let decl = ModuleDeclaration {
            class: "gsm.builtin.Echo".into(),
            path: None,
            locations: vec![],
            config: serde_json::Value::Null,
        };
        let manifest = ArchiveManifest {
            name: "dup".into(),
            plugin_id: Some(1),
            version: Some(1.0),
            description: String::new(),
            modules: vec![decl.clone(), decl],
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_garbage_bytes_fail_to_parse() {
        assert!(ArchiveManifest::from_bytes(&[0xff, 0xfe, 0x00]).is_err());
        assert!(ArchiveManifest::from_bytes(b"not = [valid").is_err());
    }
}
