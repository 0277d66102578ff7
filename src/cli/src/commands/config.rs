//! CLI configuration stored in `~/.gsm/config.toml`.
//!
//! Known keys: `api-url` and `user`. Passwords are never persisted.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::output::{self, OutputFormat};

pub const API_URL_KEY: &str = "api-url";
pub const USER_KEY: &str = "user";

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Set a configuration value
    Set {
        /// Configuration key (api-url, user)
        key: String,
        value: String,
    },

    /// Get a configuration value
    Get { key: String },

    /// Show all configuration
    Show,

    /// Reset configuration to defaults
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".gsm").join("config.toml"))
}

fn load_from(path: &Path) -> Result<CliConfig> {
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).context("Failed to parse config file")
}

fn save_to(path: &Path, cfg: &CliConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

fn validate(key: &str, value: &str) -> Result<()> {
    match key {
        API_URL_KEY if !(value.starts_with("http://") || value.starts_with("https://")) => {
            anyhow::bail!("api-url must start with http:// or https://")
        }
        API_URL_KEY | USER_KEY => Ok(()),
        "password" => anyhow::bail!("passwords are not stored, use --password or GSM_ADMIN_PASSWORD"),
        other => anyhow::bail!("unknown configuration key '{}'", other),
    }
}

/// A stored value, if the config file exists and has it.
pub fn load_value(key: &str) -> Option<String> {
    let path = config_path().ok()?;
    load_from(&path).ok().and_then(|cfg| cfg.values.get(key).cloned())
}

pub async fn execute(cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    let path = config_path()?;

    match cmd {
        ConfigCommands::Set { key, value } => {
            validate(&key, &value)?;
            let mut cfg = load_from(&path)?;
            cfg.values.insert(key.clone(), value.clone());
            save_to(&path, &cfg)?;

            match format {
                OutputFormat::Table => output::print_success(&format!("{} = {}", key, value)),
                _ => output::print_item(&serde_json::json!({ "key": key, "value": value }), format),
            }
        }

        ConfigCommands::Get { key } => {
            let cfg = load_from(&path)?;
            match cfg.values.get(&key) {
                Some(value) => match format {
                    OutputFormat::Table => println!("{}", value),
                    _ => output::print_item(&serde_json::json!({ "key": key, "value": value }), format),
                },
                None => anyhow::bail!("Key '{}' not found", key),
            }
        }

        ConfigCommands::Show => {
            let cfg = load_from(&path)?;
            if cfg.values.is_empty() {
                output::print_info("No configuration values set.");
                return Ok(());
            }
            match format {
                OutputFormat::Table => {
                    output::print_header("Configuration");
                    for (k, v) in &cfg.values {
                        output::print_detail(k, v);
                    }
                }
                _ => output::print_item(&cfg.values, format),
            }
        }

        ConfigCommands::Reset { force } => {
            if !force {
                output::print_info("This will reset all CLI configuration. Use --force to confirm.");
                return Ok(());
            }
            if path.exists() {
                std::fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
            }
            output::print_success("Configuration reset to defaults");
        }
    }

    Ok(())
}
