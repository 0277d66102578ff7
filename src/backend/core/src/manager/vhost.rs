//! Hostname to module path aliases.
//!
//! The table lives in the key-value category [`VHOST_CATEGORY`]; each
//! instance holds a snapshot that is swapped wholesale on reload.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::routing::{normalize_host, parse_module_path};
use crate::cloud::CloudBackend;
use crate::error::{GsmError, Result};

pub const VHOST_CATEGORY: &str = "vhosts";

pub struct VirtualHosts {
    backend: Arc<dyn CloudBackend>,
    table: RwLock<Arc<HashMap<String, String>>>,
}

impl VirtualHosts {
    pub fn new(backend: Arc<dyn CloudBackend>) -> Self {
        Self {
            backend,
            table: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Re-read the table from the backend and replace the snapshot.
    pub async fn reload(&self) -> Result<usize> {
        let entries = self.backend.entries(VHOST_CATEGORY).await?;
        let table: HashMap<String, String> = entries
            .into_iter()
            .filter_map(|(host, path)| path.as_str().map(|p| (host, p.to_string())))
            .collect();
        let count = table.len();
        *self.table.write() = Arc::new(table);
        info!(virtual_hosts = count, "Virtual hosts reloaded");
        Ok(count)
    }

    pub fn resolve(&self, host: &str) -> Option<String> {
        self.table.read().get(&normalize_host(host)).cloned()
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, String>> {
        Arc::clone(&self.table.read())
    }

    /// Persist `host -> path` and apply it locally.
    pub async fn set(&self, host: &str, path: &str) -> Result<()> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(GsmError::validation("virtual host name must not be empty"));
        }
        if parse_module_path(path).is_none() {
            return Err(GsmError::validation(format!(
                "virtual host target must look like /{{pluginId}}/v{{version}}/path: {}",
                path
            )));
        }

        self.backend
            .store(VHOST_CATEGORY, &host, serde_json::json!(path))
            .await?;
        self.apply(|table| {
            table.insert(host.clone(), path.to_string());
        });
        info!(host = %host, path = %path, "Virtual host set");
        Ok(())
    }

    /// Returns whether the host was mapped.
    pub async fn remove(&self, host: &str) -> Result<bool> {
        let host = normalize_host(host);
        let existed = self.table.read().contains_key(&host);
        self.backend.delete(VHOST_CATEGORY, &host).await?;
        self.apply(|table| {
            table.remove(&host);
        });
        Ok(existed)
    }

    fn apply(&self, change: impl FnOnce(&mut HashMap<String, String>)) {
        let mut guard = self.table.write();
        let mut next = (**guard).clone();
        change(&mut next);
        *guard = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{InMemoryCloud, KeyValueStore};

    #[tokio::test]
    async fn test_set_resolve_and_reload() {
        let cloud = Arc::new(InMemoryCloud::new());
        let hosts = VirtualHosts::new(cloud.clone() as Arc<dyn CloudBackend>);

        hosts.set("WWW.example.com", "/1/v1.0/test").await.unwrap();
        assert_eq!(hosts.resolve("www.example.com:443").as_deref(), Some("/1/v1.0/test"));

        let peer = VirtualHosts::new(cloud.clone() as Arc<dyn CloudBackend>);
        assert!(peer.resolve("www.example.com").is_none());
        assert_eq!(peer.reload().await.unwrap(), 1);
        assert_eq!(peer.resolve("www.example.com").as_deref(), Some("/1/v1.0/test"));

        assert!(hosts.remove("www.example.com").await.unwrap());
        assert!(cloud.retrieve(VHOST_CATEGORY, "www.example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_invalid_target() {
        let cloud = Arc::new(InMemoryCloud::new());
        let hosts = VirtualHosts::new(cloud as Arc<dyn CloudBackend>);
        assert!(hosts.set("a.example.com", "/health").await.is_err());
    }
}
