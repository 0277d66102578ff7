//! Module archive administration: list, upload, delete, enable, disable
//! and per-archive configuration.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ModuleCommands {
    /// List installed modules
    List {
        /// Only show modules of this plugin id
        #[arg(short, long)]
        plugin: Option<i64>,
    },

    /// Upload an archive
    Upload {
        /// Archive file
        file: PathBuf,

        #[arg(long)]
        plugin_id: i64,

        #[arg(long)]
        plugin_version: String,

        /// Display name; the archive is stored as `pluginId_name-version`
        #[arg(long)]
        name: String,
    },

    /// Delete an archive and its modules
    Delete {
        plugin_id: i64,
        plugin_version: String,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// Enable every module of an archive
    Enable { plugin_id: i64, plugin_version: String },

    /// Disable every module of an archive
    Disable { plugin_id: i64, plugin_version: String },

    /// Show or replace an archive's configuration
    Config {
        plugin_id: i64,
        plugin_version: String,

        /// New configuration as a JSON object, or `@file` to read it from a file
        #[arg(long)]
        set: Option<String>,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModuleInfo {
    plugin_id: i64,
    version: f64,
    implementation_class_name: String,
    archive_name: String,
    display_name: String,
    enabled: bool,
    #[serde(default)]
    capabilities: Vec<String>,
    installed_on: DateTime<Utc>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    locations: Vec<String>,
}

#[derive(Debug, Serialize, Tabled)]
struct ModuleRow {
    #[tabled(rename = "Plugin")]
    plugin_id: i64,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Class")]
    class: String,
    #[tabled(rename = "Capabilities")]
    capabilities: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
    #[tabled(rename = "Locations")]
    locations: String,
    #[tabled(rename = "Installed")]
    installed: String,
}

impl From<&ModuleInfo> for ModuleRow {
    fn from(m: &ModuleInfo) -> Self {
        Self {
            plugin_id: m.plugin_id,
            version: format_version(m.version),
            class: m.implementation_class_name.clone(),
            capabilities: m.capabilities.join(","),
            enabled: if m.enabled { "yes".into() } else { "no".into() },
            locations: if m.locations.is_empty() {
                "*".into()
            } else {
                m.locations.join(",")
            },
            installed: m.installed_on.format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct DeleteResult {
    deleted: bool,
}

fn format_version(version: f64) -> String {
    if version.fract() == 0.0 {
        format!("{:.1}", version)
    } else {
        version.to_string()
    }
}

fn archive_path(plugin_id: i64, version: &str) -> String {
    format!("/admin/modules/{}/{}", plugin_id, version)
}

/// Parse `--set`: inline JSON or `@path`.
fn read_configuration(arg: &str) -> Result<serde_json::Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?,
        None => arg.to_string(),
    };
    let value: serde_json::Value = serde_json::from_str(&text).context("Configuration is not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("Configuration must be a JSON object");
    }
    Ok(value)
}

pub async fn execute(cmd: ModuleCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        ModuleCommands::List { plugin } => {
            let modules: Vec<ModuleInfo> = client.get("/admin/modules").await?;
            let modules: Vec<ModuleInfo> = modules
                .into_iter()
                .filter(|m| plugin.map(|p| p == m.plugin_id).unwrap_or(true))
                .collect();
            match format {
                OutputFormat::Table => {
                    let rows: Vec<ModuleRow> = modules.iter().map(ModuleRow::from).collect();
                    output::print_list(&rows, format);
                }
                _ => output::print_item(&modules, format),
            }
        }

        ModuleCommands::Upload {
            file,
            plugin_id,
            plugin_version: version,
            name,
        } => {
            let bytes = std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
            let size = bytes.len();
            let path = format!(
                "/admin/modules?pluginId={}&version={}&name={}",
                plugin_id,
                version,
                encode_query(&name)
            );
            let modules: Vec<ModuleInfo> = client.post_bytes(&path, bytes).await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!(
                        "Uploaded {} ({} bytes), {} module(s) recorded",
                        file.display(),
                        size,
                        modules.len()
                    ));
                    let rows: Vec<ModuleRow> = modules.iter().map(ModuleRow::from).collect();
                    output::print_list(&rows, format);
                }
                _ => output::print_item(&modules, format),
            }
        }

        ModuleCommands::Delete {
            plugin_id,
            plugin_version: version,
            force,
        } => {
            if !force {
                output::print_info(&format!(
                    "This will delete archive {} version {} and stop its modules. Use --force to confirm.",
                    plugin_id, version
                ));
                return Ok(());
            }
            let result: DeleteResult = client.delete(&archive_path(plugin_id, &version)).await?;
            match format {
                OutputFormat::Table if result.deleted => {
                    output::print_success(&format!("Deleted {} version {}", plugin_id, version))
                }
                OutputFormat::Table => {
                    output::print_warning(&format!("Nothing installed as {} version {}", plugin_id, version))
                }
                _ => output::print_item(&result, format),
            }
        }

        ModuleCommands::Enable { plugin_id, plugin_version: version } => {
            let path = format!("{}/enable", archive_path(plugin_id, &version));
            let modules: Vec<ModuleInfo> = client.post(&path).await?;
            report_toggle("Enabled", plugin_id, &version, &modules, format);
        }

        ModuleCommands::Disable { plugin_id, plugin_version: version } => {
            let path = format!("{}/disable", archive_path(plugin_id, &version));
            let modules: Vec<ModuleInfo> = client.post(&path).await?;
            report_toggle("Disabled", plugin_id, &version, &modules, format);
        }

        ModuleCommands::Config {
            plugin_id,
            plugin_version: version,
            set,
        } => {
            let path = format!("{}/config", archive_path(plugin_id, &version));
            match set {
                Some(arg) => {
                    let configuration = read_configuration(&arg)?;
                    client.put(&path, &configuration).await?;
                    output::print_success(&format!("Configuration of {} version {} updated", plugin_id, version));
                }
                None => {
                    let configuration: serde_json::Value = client.get(&path).await?;
                    output::print_item(&configuration, format);
                }
            }
        }
    }

    Ok(())
}

fn report_toggle(action: &str, plugin_id: i64, version: &str, modules: &[ModuleInfo], format: OutputFormat) {
    match format {
        OutputFormat::Table => output::print_success(&format!(
            "{} {} module(s) of {} version {}",
            action,
            modules.len(),
            plugin_id,
            version
        )),
        _ => output::print_item(&modules, format),
    }
}

/// Percent-encode a query value.
fn encode_query(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            _ => format!("%{:02X}", b),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_query() {
        assert_eq!(encode_query("Demo Plugin"), "Demo%20Plugin");
        assert_eq!(encode_query("a&b=c"), "a%26b%3Dc");
    }

    #[test]
    fn test_read_configuration_requires_object() {
        assert!(read_configuration(r#"{"greeting":"hi"}"#).is_ok());
        assert!(read_configuration("[1,2]").is_err());
        assert!(read_configuration("not json").is_err());
    }

    #[test]
    fn test_read_configuration_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.json");
        std::fs::write(&file, r#"{"period_ms": 500}"#).unwrap();

        let value = read_configuration(&format!("@{}", file.display())).unwrap();
        assert_eq!(value["period_ms"], 500);
    }

    #[test]
    fn test_module_row_formatting() {
        let info: ModuleInfo = serde_json::from_value(serde_json::json!({
            "pluginId": 7,
            "version": 2.0,
            "implementationClassName": "gsm.builtin.Echo",
            "archiveName": "7_demo-2.0",
            "displayName": "demo",
            "enabled": true,
            "capabilities": ["event"],
            "installedOn": "2024-03-01T12:30:00Z",
            "locations": []
        }))
        .unwrap();

        let row = ModuleRow::from(&info);
        assert_eq!(row.version, "2.0");
        assert_eq!(row.locations, "*");
        assert_eq!(row.installed, "2024-03-01 12:30");
    }
}
