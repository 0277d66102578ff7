//! Configuration management.
//!
//! Every field has a default, so an empty environment yields a runnable
//! single-node configuration backed by the in-memory cloud.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub instance: InstanceConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub queues: QueueConfig,

    #[serde(default)]
    pub plugins: PluginConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// How long shutdown waits for queue listeners before aborting them
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Location (site or region) this instance belongs to
    #[serde(default = "default_location")]
    pub location: String,

    /// Directory holding the instance id file; platform temp dir when unset
    pub id_file_dir: Option<PathBuf>,

    #[serde(default = "default_id_file_name")]
    pub id_file_name: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            location: default_location(),
            id_file_dir: None,
            id_file_name: default_id_file_name(),
        }
    }
}

impl InstanceConfig {
    pub fn id_file_dir(&self) -> PathBuf {
        self.id_file_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix applied to every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Name of the fleet-wide queue
    #[serde(default = "default_global_queue")]
    pub global_queue: String,

    /// Longest a single poll blocks waiting for messages
    #[serde(default = "default_poll_wait", with = "humantime_serde")]
    pub poll_wait: Duration,

    /// Delay before re-creating a queue that vanished
    #[serde(default = "default_missing_queue_retry", with = "humantime_serde")]
    pub missing_queue_retry: Duration,

    /// A listener that has not polled for this long is reported dead
    #[serde(default = "default_dead_threshold", with = "humantime_serde")]
    pub dead_threshold: Duration,

    /// Worker pool size shared by all listeners
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Longest a listener waits for a free worker
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            global_queue: default_global_queue(),
            poll_wait: default_poll_wait(),
            missing_queue_retry: default_missing_queue_retry(),
            dead_threshold: default_dead_threshold(),
            worker_threads: default_worker_threads(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    /// Deadline for a single module invocation
    #[serde(default = "default_invocation_timeout", with = "humantime_serde")]
    pub invocation_timeout: Duration,

    /// Consecutive timeouts tolerated before the process exits
    #[serde(default = "default_max_timeout_count")]
    pub max_timeout_count: u32,

    /// Minimum available memory required to accept work
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold_bytes: u64,

    /// Freshness window for the per-location live module cache
    #[serde(default = "default_module_cache_ttl", with = "humantime_serde")]
    pub module_cache_ttl: Duration,

    /// Monitoring window keys such as "1M" or "5M"
    #[serde(default = "default_monitoring_windows")]
    pub monitoring_windows: Vec<String>,

    /// `pluginId:moduleClass` entries never dispatched as batch
    #[serde(default)]
    pub blacklist: Vec<String>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            invocation_timeout: default_invocation_timeout(),
            max_timeout_count: default_max_timeout_count(),
            memory_threshold_bytes: default_memory_threshold(),
            module_cache_ttl: default_module_cache_ttl(),
            monitoring_windows: default_monitoring_windows(),
            blacklist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Fleet-health heartbeat period
    #[serde(default = "default_watchdog_interval", with = "humantime_serde")]
    pub watchdog_interval: Duration,

    /// How often this instance generates its own scheduler tick
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Minimum uptime before this instance dispatches batches
    #[serde(default = "default_startup_delay", with = "humantime_serde")]
    pub startup_delay: Duration,

    /// Minimum age of the location's last run before another dispatch
    #[serde(default = "default_batch_window", with = "humantime_serde")]
    pub batch_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            watchdog_interval: default_watchdog_interval(),
            tick_interval: default_tick_interval(),
            startup_delay: default_startup_delay(),
            batch_window: default_batch_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_user")]
    pub username: String,

    /// Admin routes reject every request while this is unset
    pub password: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            username: default_admin_user(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// json, pretty or compact
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Install the Prometheus recorder
    #[serde(default = "default_prometheus")]
    pub prometheus: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            prometheus: default_prometheus(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_shutdown_grace() -> Duration { Duration::from_secs(10) }
fn default_location() -> String { "default".to_string() }
fn default_id_file_name() -> String { "gsm-instance.uuid".to_string() }
fn default_backend_kind() -> BackendKind { BackendKind::Memory }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "gsm".to_string() }
fn default_global_queue() -> String { "gsm-global".to_string() }
fn default_poll_wait() -> Duration { Duration::from_secs(5) }
fn default_missing_queue_retry() -> Duration { Duration::from_secs(10) }
fn default_dead_threshold() -> Duration { Duration::from_secs(2 * 60 * 60) }
fn default_worker_threads() -> usize { 32 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(30) }
fn default_invocation_timeout() -> Duration { Duration::from_secs(20) }
fn default_max_timeout_count() -> u32 { 10 }
fn default_memory_threshold() -> u64 { 64 * 1024 * 1024 }
fn default_module_cache_ttl() -> Duration { Duration::from_secs(5 * 60) }
fn default_monitoring_windows() -> Vec<String> {
    vec!["1M".to_string(), "5M".to_string(), "15M".to_string()]
}
fn default_watchdog_interval() -> Duration { Duration::from_secs(15 * 60) }
fn default_tick_interval() -> Duration { Duration::from_secs(60) }
fn default_startup_delay() -> Duration { Duration::from_secs(5 * 60) }
fn default_batch_window() -> Duration { Duration::from_secs(50) }
fn default_admin_user() -> String { "admin".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }
fn default_prometheus() -> bool { true }

impl Config {
    /// Load configuration from the environment (`GSM__SECTION__FIELD`).
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(Self::environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(Self::environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("GSM")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("plugins.blacklist")
            .with_list_parse_key("plugins.monitoring_windows")
    }
}
