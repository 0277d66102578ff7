//! Cloud backend abstraction.
//!
//! The runtime consumes queues, a key-value store, a NoSQL table store, a
//! module archive store and a fleet-health hook through the traits in this
//! module. [`InMemoryCloud`] serves tests and single-node deployments;
//! [`RedisCloud`] lets a fleet of instances share one Redis server.

pub mod memory;
pub mod redis_cloud;

pub use self::memory::InMemoryCloud;
pub use self::redis_cloud::RedisCloud;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{BackendConfig, BackendKind};

/// Category used by the unscoped key-value operations.
pub const DEFAULT_CATEGORY: &str = "default";

/// Most messages a single poll hands back.
pub const MAX_POLL_BATCH: usize = 10;

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum CloudError {
    /// The queue was deleted or never defined.
    #[error("queue does not exist: {0}")]
    QueueDoesNotExist(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Transient failure; callers treat the operation as a no-op.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for CloudError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type CloudResult<T> = std::result::Result<T, CloudError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Naming
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle to a defined queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueRef {
    pub name: String,
    pub url: String,
}

pub fn location_queue_name(location: &str) -> String {
    format!("gsm-location-{}", location)
}

pub fn instance_queue_prefix(location: &str) -> String {
    format!("gsm-instance-{}-", location)
}

pub fn instance_queue_name(location: &str, instance_id: Uuid) -> String {
    format!("{}{}", instance_queue_prefix(location), instance_id)
}

/// Hex SHA-256 of an archive, recorded at upload.
pub fn archive_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queues
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait QueueService: Send + Sync {
    /// Create the queue if needed and return its handle.
    async fn define_queue(&self, name: &str) -> CloudResult<QueueRef>;

    async fn create_instance_queue(&self, location: &str, instance_id: Uuid) -> CloudResult<QueueRef> {
        self.define_queue(&instance_queue_name(location, instance_id)).await
    }

    async fn delete_queue(&self, queue: &QueueRef) -> CloudResult<()>;

    /// Look up an existing queue by name.
    async fn queue_id(&self, name: &str) -> CloudResult<Option<QueueRef>>;

    /// Instance queues registered at `location`.
    async fn list_queue_ids(&self, location: &str) -> CloudResult<Vec<QueueRef>>;

    async fn send_message(&self, queue: &QueueRef, json: &str) -> CloudResult<()>;

    /// Wait up to `wait` for messages and return them.
    ///
    /// Fails with [`CloudError::QueueDoesNotExist`] when the queue is gone.
    async fn receive_messages(&self, queue: &QueueRef, wait: Duration) -> CloudResult<Vec<String>>;

    /// Receive and hand every message to `handler`, returning the count.
    async fn poll_queue(
        &self,
        queue: &QueueRef,
        wait: Duration,
        handler: &(dyn Fn(String) + Send + Sync),
    ) -> CloudResult<usize> {
        let messages = self.receive_messages(queue, wait).await?;
        let count = messages.len();
        for message in messages {
            handler(message);
        }
        Ok(count)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Key-Value
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn store(&self, category: &str, key: &str, value: serde_json::Value) -> CloudResult<()>;

    async fn retrieve(&self, category: &str, key: &str) -> CloudResult<Option<serde_json::Value>>;

    async fn delete(&self, category: &str, key: &str) -> CloudResult<()>;

    /// Every entry in `category`.
    async fn entries(&self, category: &str) -> CloudResult<Vec<(String, serde_json::Value)>>;
}

/// Typed helpers over [`KeyValueStore`].
#[async_trait]
pub trait KeyValueExt: KeyValueStore {
    async fn store_as<T: Serialize + Sync>(&self, category: &str, key: &str, value: &T) -> CloudResult<()> {
        self.store(category, key, serde_json::to_value(value)?).await
    }

    async fn retrieve_as<T: DeserializeOwned + Send>(&self, category: &str, key: &str) -> CloudResult<Option<T>> {
        match self.retrieve(category, key).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn put<T: Serialize + Sync>(&self, key: &str, value: &T) -> CloudResult<()> {
        self.store_as(DEFAULT_CATEGORY, key, value).await
    }

    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> CloudResult<Option<T>> {
        self.retrieve_as(DEFAULT_CATEGORY, key).await
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueExt for S {}

// ═══════════════════════════════════════════════════════════════════════════════
// Tables
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait TableStore: Send + Sync {
    async fn has_table(&self, table: &str) -> CloudResult<bool>;

    async fn create_table(&self, table: &str) -> CloudResult<()>;

    async fn drop_table(&self, table: &str) -> CloudResult<()>;

    async fn list(&self, table: &str) -> CloudResult<Vec<serde_json::Value>>;

    /// Rows whose top-level `field` equals `value`.
    async fn query(&self, table: &str, field: &str, value: &serde_json::Value) -> CloudResult<Vec<serde_json::Value>> {
        Ok(self
            .list(table)
            .await?
            .into_iter()
            .filter(|row| row.get(field) == Some(value))
            .collect())
    }

    async fn get_row(&self, table: &str, key: &str) -> CloudResult<Option<serde_json::Value>>;

    async fn save(&self, table: &str, key: &str, row: serde_json::Value) -> CloudResult<()>;

    async fn delete_row(&self, table: &str, key: &str) -> CloudResult<bool>;
}

/// Typed helpers over [`TableStore`].
#[async_trait]
pub trait TableExt: TableStore {
    async fn list_as<T: DeserializeOwned + Send>(&self, table: &str) -> CloudResult<Vec<T>> {
        self.list(table)
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(row).map_err(CloudError::from))
            .collect()
    }

    async fn get_as<T: DeserializeOwned + Send>(&self, table: &str, key: &str) -> CloudResult<Option<T>> {
        match self.get_row(table, key).await? {
            Some(row) => Ok(Some(serde_json::from_value(row)?)),
            None => Ok(None),
        }
    }

    async fn save_as<T: Serialize + Sync>(&self, table: &str, key: &str, row: &T) -> CloudResult<()> {
        self.save(table, key, serde_json::to_value(row)?).await
    }
}

impl<S: TableStore + ?Sized> TableExt for S {}

// ═══════════════════════════════════════════════════════════════════════════════
// Module Archives
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait ModuleStore: Send + Sync {
    async fn upload_module(&self, archive: &str, bytes: Vec<u8>) -> CloudResult<()>;

    async fn get_module(&self, archive: &str) -> CloudResult<Option<Vec<u8>>>;

    /// Returns false when nothing was stored under `archive`.
    async fn remove_module(&self, archive: &str) -> CloudResult<bool>;

    async fn module_install_date(&self, archive: &str) -> CloudResult<Option<DateTime<Utc>>>;

    async fn list_modules(&self) -> CloudResult<Vec<String>>;

    /// Checksum recorded at upload, available without downloading.
    async fn module_checksum(&self, archive: &str) -> CloudResult<Option<String>>;

    async fn module_configuration(&self, archive: &str) -> CloudResult<Option<serde_json::Value>>;

    async fn set_module_configuration(&self, archive: &str, configuration: serde_json::Value) -> CloudResult<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fleet Health
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait FleetHealth: Send + Sync {
    /// Heartbeat for one instance.
    async fn watchdog(&self, location: &str, instance_id: Uuid, queue: &QueueRef) -> CloudResult<()>;

    /// Locations with at least one registered instance.
    async fn locations(&self) -> CloudResult<Vec<String>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything the runtime needs from a cloud provider.
#[async_trait]
pub trait CloudBackend: QueueService + KeyValueStore + TableStore + ModuleStore + FleetHealth {
    fn name(&self) -> &'static str;

    /// Cheap reachability probe for health checks.
    async fn ping(&self) -> CloudResult<()>;
}

/// Open the backend named by the configuration.
pub async fn connect(config: &BackendConfig) -> CloudResult<std::sync::Arc<dyn CloudBackend>> {
    match config.kind {
        BackendKind::Memory => {
            tracing::info!("Using in-memory cloud backend");
            Ok(std::sync::Arc::new(InMemoryCloud::new()))
        }
        BackendKind::Redis => {
            let cloud = RedisCloud::connect(&config.redis_url, config.key_prefix.clone()).await?;
            tracing::info!(prefix = %config.key_prefix, "Connected to Redis cloud backend");
            Ok(std::sync::Arc::new(cloud))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names() {
        let id = Uuid::nil();
        assert_eq!(location_queue_name("eu"), "gsm-location-eu");
        assert!(instance_queue_name("eu", id).starts_with(&instance_queue_prefix("eu")));
    }

    #[test]
    fn test_archive_checksum_is_stable() {
        let a = archive_checksum(b"module");
        assert_eq!(a, archive_checksum(b"module"));
        assert_ne!(a, archive_checksum(b"module2"));
        assert_eq!(a.len(), 64);
    }
}
