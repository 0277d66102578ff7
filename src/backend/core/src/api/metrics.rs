//! The JSON document served at `/metrics`.

use serde::Serialize;
use std::time::Duration;

use super::AppState;
use crate::manager::MonitoringSnapshot;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseMetrics {
    pub uptime_secs: u64,
    pub memory: MemoryMetrics,
    pub threads: ThreadMetrics,
    pub modules: ModuleMetrics,
    pub cpu: CpuMetrics,
    pub gc: GcMetrics,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMetrics {
    pub resident_bytes: u64,
    pub available_bytes: u64,
    pub threshold_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMetrics {
    pub runtime_workers: usize,
    pub active_dispatches: usize,
    pub max_dispatches: usize,
    pub fixed_tasks: usize,
}

/// Installed and loaded module counts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleMetrics {
    pub installed: usize,
    pub live: usize,
    pub loaded_units: usize,
    pub total_builds: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuMetrics {
    pub available_processors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_average: Option<[f64; 3]>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcMetrics {
    /// Cache purges forced by the memory guard
    pub purges: u64,
}

/// 1, 5 and 15 minute load averages.
#[cfg(unix)]
pub fn load_average() -> Option<[f64; 3]> {
    let mut loads = [0f64; 3];
    // SAFETY: getloadavg writes at most 3 doubles into the buffer
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    (n == 3).then_some(loads)
}

#[cfg(not(unix))]
pub fn load_average() -> Option<[f64; 3]> {
    None
}

pub async fn collect_base(state: &AppState, uptime: Duration) -> BaseMetrics {
    let manager = &state.manager;
    let memory = manager.memory_guard();
    let installed = match manager.list_modules().await {
        Ok(modules) => modules.len(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to count installed modules");
            0
        }
    };
    let live = manager.get_live_module_list(manager.location()).await.len();

    BaseMetrics {
        uptime_secs: uptime.as_secs(),
        memory: MemoryMetrics {
            resident_bytes: memory.resident_bytes(),
            available_bytes: memory.available_bytes(),
            threshold_bytes: memory.threshold(),
        },
        threads: ThreadMetrics {
            runtime_workers: tokio::runtime::Handle::current().metrics().num_workers(),
            active_dispatches: state.pool.active_workers(),
            max_dispatches: state.pool.max_workers(),
            fixed_tasks: manager.fixed().running().len(),
        },
        modules: ModuleMetrics {
            installed,
            live,
            loaded_units: manager.loader().loaded_units(),
            total_builds: manager.loader().total_builds(),
        },
        cpu: CpuMetrics {
            available_processors: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            load_average: load_average(),
        },
        gc: GcMetrics {
            purges: memory.reclaims(),
        },
    }
}

/// `base`, `monitoring`, then one entry per health check keyed by its name.
pub async fn build_document(state: &AppState) -> serde_json::Value {
    let base = collect_base(state, state.started_at.elapsed()).await;
    let monitoring: Vec<MonitoringSnapshot> = state.manager.monitoring_snapshot();
    let report = state.health.check_health().await;

    let mut document = serde_json::Map::new();
    document.insert("base".into(), serde_json::to_value(base).unwrap_or_default());
    document.insert(
        "monitoring".into(),
        serde_json::to_value(monitoring).unwrap_or_default(),
    );
    for component in report.components {
        let name = component.name.clone();
        document.insert(name, serde_json::to_value(component).unwrap_or_default());
    }
    serde_json::Value::Object(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_load_average_available_on_linux() {
        let loads = load_average().unwrap();
        assert!(loads.iter().all(|l| *l >= 0.0));
    }
}
