//! In-process cloud backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{
    archive_checksum, instance_queue_prefix, CloudBackend, CloudError, CloudResult, FleetHealth,
    KeyValueStore, ModuleStore, QueueRef, QueueService, TableStore, MAX_POLL_BATCH,
};

#[derive(Default)]
struct MemoryQueue {
    messages: Mutex<VecDeque<String>>,
    notify: Notify,
}

struct StoredArchive {
    bytes: Arc<Vec<u8>>,
    checksum: String,
    installed_on: DateTime<Utc>,
    configuration: Option<serde_json::Value>,
}

/// Last heartbeat seen for one instance.
#[derive(Debug, Clone)]
pub struct FleetRecord {
    pub location: String,
    pub queue: QueueRef,
    pub last_seen: DateTime<Utc>,
}

/// Cloud backend holding everything in process memory.
///
/// Besides the backend contract it exposes counters and failure switches
/// used by tests to observe backend traffic.
#[derive(Default)]
pub struct InMemoryCloud {
    queues: DashMap<String, Arc<MemoryQueue>>,
    kv: DashMap<(String, String), serde_json::Value>,
    tables: RwLock<HashMap<String, BTreeMap<String, serde_json::Value>>>,
    archives: DashMap<String, StoredArchive>,
    fleet: DashMap<Uuid, FleetRecord>,

    table_reads: AtomicUsize,
    module_downloads: AtomicUsize,
    watchdog_calls: AtomicUsize,
    fail_receives: AtomicUsize,
    fail_watchdog: AtomicBool,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of table list/get calls served so far.
    pub fn table_reads(&self) -> usize {
        self.table_reads.load(Ordering::SeqCst)
    }

    /// Number of archive downloads served so far.
    pub fn module_downloads(&self) -> usize {
        self.module_downloads.load(Ordering::SeqCst)
    }

    pub fn watchdog_calls(&self) -> usize {
        self.watchdog_calls.load(Ordering::SeqCst)
    }

    /// Make the next `n` receives fail with a transient error.
    pub fn fail_next_receives(&self, n: usize) {
        self.fail_receives.store(n, Ordering::SeqCst);
    }

    pub fn set_watchdog_failing(&self, failing: bool) {
        self.fail_watchdog.store(failing, Ordering::SeqCst);
    }

    pub fn fleet_record(&self, instance_id: Uuid) -> Option<FleetRecord> {
        self.fleet.get(&instance_id).map(|r| r.clone())
    }

    /// Messages waiting in `name`, without consuming them.
    pub fn peek_queue(&self, name: &str) -> Vec<String> {
        self.queues
            .get(name)
            .map(|q| q.messages.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Simulate an external deletion of `name`.
    pub fn drop_queue(&self, name: &str) {
        if let Some((_, queue)) = self.queues.remove(name) {
            queue.notify.notify_waiters();
        }
    }

    /// Replace the stored bytes of `archive` but keep its recorded checksum.
    pub fn tamper_module(&self, archive: &str, bytes: Vec<u8>) {
        if let Some(mut stored) = self.archives.get_mut(archive) {
            stored.bytes = Arc::new(bytes);
        }
    }

    fn queue_ref(name: &str) -> QueueRef {
        QueueRef {
            name: name.to_string(),
            url: format!("memory://{}", name),
        }
    }

    fn drain(queue: &MemoryQueue) -> Vec<String> {
        let mut messages = queue.messages.lock();
        let n = messages.len().min(MAX_POLL_BATCH);
        messages.drain(..n).collect()
    }
}

#[async_trait]
impl QueueService for InMemoryCloud {
    async fn define_queue(&self, name: &str) -> CloudResult<QueueRef> {
        self.queues.entry(name.to_string()).or_default();
        Ok(Self::queue_ref(name))
    }

    async fn delete_queue(&self, queue: &QueueRef) -> CloudResult<()> {
        self.drop_queue(&queue.name);
        Ok(())
    }

    async fn queue_id(&self, name: &str) -> CloudResult<Option<QueueRef>> {
        Ok(self.queues.contains_key(name).then(|| Self::queue_ref(name)))
    }

    async fn list_queue_ids(&self, location: &str) -> CloudResult<Vec<QueueRef>> {
        let prefix = instance_queue_prefix(location);
        let mut refs: Vec<QueueRef> = self
            .queues
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| Self::queue_ref(e.key()))
            .collect();
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }

    async fn send_message(&self, queue: &QueueRef, json: &str) -> CloudResult<()> {
        let target = self
            .queues
            .get(&queue.name)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| CloudError::QueueDoesNotExist(queue.name.clone()))?;
        target.messages.lock().push_back(json.to_string());
        target.notify.notify_one();
        Ok(())
    }

    async fn receive_messages(&self, queue: &QueueRef, wait: Duration) -> CloudResult<Vec<String>> {
        let failing = self
            .fail_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CloudError::Unavailable("injected receive failure".into()));
        }

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let target = self
                .queues
                .get(&queue.name)
                .map(|q| Arc::clone(q.value()))
                .ok_or_else(|| CloudError::QueueDoesNotExist(queue.name.clone()))?;

            let batch = Self::drain(&target);
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, target.notify.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryCloud {
    async fn store(&self, category: &str, key: &str, value: serde_json::Value) -> CloudResult<()> {
        self.kv.insert((category.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn retrieve(&self, category: &str, key: &str) -> CloudResult<Option<serde_json::Value>> {
        Ok(self
            .kv
            .get(&(category.to_string(), key.to_string()))
            .map(|v| v.clone()))
    }

    async fn delete(&self, category: &str, key: &str) -> CloudResult<()> {
        self.kv.remove(&(category.to_string(), key.to_string()));
        Ok(())
    }

    async fn entries(&self, category: &str) -> CloudResult<Vec<(String, serde_json::Value)>> {
        let mut entries: Vec<_> = self
            .kv
            .iter()
            .filter(|e| e.key().0 == category)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[async_trait]
impl TableStore for InMemoryCloud {
    async fn has_table(&self, table: &str) -> CloudResult<bool> {
        Ok(self.tables.read().contains_key(table))
    }

    async fn create_table(&self, table: &str) -> CloudResult<()> {
        self.tables.write().entry(table.to_string()).or_default();
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> CloudResult<()> {
        self.tables.write().remove(table);
        Ok(())
    }

    async fn list(&self, table: &str) -> CloudResult<Vec<serde_json::Value>> {
        self.table_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_row(&self, table: &str, key: &str) -> CloudResult<Option<serde_json::Value>> {
        self.table_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(key).cloned()))
    }

    async fn save(&self, table: &str, key: &str, row: serde_json::Value) -> CloudResult<()> {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), row);
        Ok(())
    }

    async fn delete_row(&self, table: &str, key: &str) -> CloudResult<bool> {
        Ok(self
            .tables
            .write()
            .get_mut(table)
            .map(|rows| rows.remove(key).is_some())
            .unwrap_or(false))
    }
}

#[async_trait]
impl ModuleStore for InMemoryCloud {
    async fn upload_module(&self, archive: &str, bytes: Vec<u8>) -> CloudResult<()> {
        let checksum = archive_checksum(&bytes);
        let configuration = self
            .archives
            .get(archive)
            .and_then(|a| a.configuration.clone());
        self.archives.insert(
            archive.to_string(),
            StoredArchive {
                bytes: Arc::new(bytes),
                checksum,
                installed_on: Utc::now(),
                configuration,
            },
        );
        Ok(())
    }

    async fn get_module(&self, archive: &str) -> CloudResult<Option<Vec<u8>>> {
        self.module_downloads.fetch_add(1, Ordering::SeqCst);
        Ok(self.archives.get(archive).map(|a| a.bytes.as_ref().clone()))
    }

    async fn remove_module(&self, archive: &str) -> CloudResult<bool> {
        Ok(self.archives.remove(archive).is_some())
    }

    async fn module_install_date(&self, archive: &str) -> CloudResult<Option<DateTime<Utc>>> {
        Ok(self.archives.get(archive).map(|a| a.installed_on))
    }

    async fn list_modules(&self) -> CloudResult<Vec<String>> {
        let mut names: Vec<String> = self.archives.iter().map(|a| a.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn module_checksum(&self, archive: &str) -> CloudResult<Option<String>> {
        Ok(self.archives.get(archive).map(|a| a.checksum.clone()))
    }

    async fn module_configuration(&self, archive: &str) -> CloudResult<Option<serde_json::Value>> {
        Ok(self
            .archives
            .get(archive)
            .and_then(|a| a.configuration.clone()))
    }

    async fn set_module_configuration(&self, archive: &str, configuration: serde_json::Value) -> CloudResult<()> {
        let mut entry = self
            .archives
            .get_mut(archive)
            .ok_or_else(|| CloudError::NotFound(archive.to_string()))?;
        entry.configuration = Some(configuration);
        Ok(())
    }
}

#[async_trait]
impl FleetHealth for InMemoryCloud {
    async fn watchdog(&self, location: &str, instance_id: Uuid, queue: &QueueRef) -> CloudResult<()> {
        self.watchdog_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_watchdog.load(Ordering::SeqCst) {
            return Err(CloudError::Unavailable("injected watchdog failure".into()));
        }
        self.fleet.insert(
            instance_id,
            FleetRecord {
                location: location.to_string(),
                queue: queue.clone(),
                last_seen: Utc::now(),
            },
        );
        Ok(())
    }

    async fn locations(&self) -> CloudResult<Vec<String>> {
        let mut locations: Vec<String> = self.fleet.iter().map(|r| r.location.clone()).collect();
        locations.sort();
        locations.dedup();
        Ok(locations)
    }
}

#[async_trait]
impl CloudBackend for InMemoryCloud {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> CloudResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::KeyValueExt;

    #[tokio::test]
    async fn test_send_and_receive() {
        let cloud = InMemoryCloud::new();
        let queue = cloud.define_queue("q").await.unwrap();
        cloud.send_message(&queue, "one").await.unwrap();
        cloud.send_message(&queue, "two").await.unwrap();

        let got = cloud
            .receive_messages(&queue, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(got, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_receive_waits_for_message() {
        let cloud = Arc::new(InMemoryCloud::new());
        let queue = cloud.define_queue("q").await.unwrap();

        let sender = Arc::clone(&cloud);
        let q = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.send_message(&q, "late").await.unwrap();
        });

        let got = cloud
            .receive_messages(&queue, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(got, vec!["late".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_queue_is_distinguished() {
        let cloud = InMemoryCloud::new();
        let queue = cloud.define_queue("q").await.unwrap();
        cloud.drop_queue("q");

        let err = cloud
            .receive_messages(&queue, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::QueueDoesNotExist(name) if name == "q"));
    }

    #[tokio::test]
    async fn test_list_instance_queues_by_location() {
        let cloud = InMemoryCloud::new();
        cloud.create_instance_queue("eu", Uuid::new_v4()).await.unwrap();
        cloud.create_instance_queue("eu", Uuid::new_v4()).await.unwrap();
        cloud.create_instance_queue("us", Uuid::new_v4()).await.unwrap();

        assert_eq!(cloud.list_queue_ids("eu").await.unwrap().len(), 2);
        assert_eq!(cloud.list_queue_ids("us").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_typed_key_value() {
        let cloud = InMemoryCloud::new();
        cloud.put("answer", &42_u32).await.unwrap();
        assert_eq!(cloud.get::<u32>("answer").await.unwrap(), Some(42));
        assert_eq!(cloud.get::<u32>("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_archive_keeps_configuration_across_reupload() {
        let cloud = InMemoryCloud::new();
        cloud.upload_module("1_demo-1.0", b"a".to_vec()).await.unwrap();
        cloud
            .set_module_configuration("1_demo-1.0", serde_json::json!({"k": 1}))
            .await
            .unwrap();
        cloud.upload_module("1_demo-1.0", b"b".to_vec()).await.unwrap();

        assert_eq!(
            cloud.module_configuration("1_demo-1.0").await.unwrap(),
            Some(serde_json::json!({"k": 1}))
        );
        assert_eq!(
            cloud.module_checksum("1_demo-1.0").await.unwrap(),
            Some(archive_checksum(b"b"))
        );
    }
}
