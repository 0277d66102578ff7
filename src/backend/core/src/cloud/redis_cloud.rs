//! Redis-backed cloud backend for multi-instance fleets.
//!
//! Layout under the configured prefix:
//! - `{p}:queues` set of queue names, `{p}:queue:{name}` list per queue
//! - `{p}:kv:{category}` hash of JSON values
//! - `{p}:tables` set, `{p}:table:{table}` hash of JSON rows
//! - `{p}:archives` set, `{p}:archive:{name}` bytes, `{p}:archive-meta:{name}` hash
//! - `{p}:locations` set, `{p}:fleet:{instance}` heartbeat with expiry

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::{
    archive_checksum, instance_queue_prefix, CloudBackend, CloudError, CloudResult, FleetHealth,
    KeyValueStore, ModuleStore, QueueRef, QueueService, TableStore, MAX_POLL_BATCH,
};

/// Heartbeat keys outlive a few missed watchdog runs.
const HEARTBEAT_TTL_SECS: u64 = 60 * 60;

impl From<redis::RedisError> for CloudError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            CloudError::Unavailable(e.to_string())
        } else {
            CloudError::Backend(e.to_string())
        }
    }
}

pub struct RedisCloud {
    client: redis::Client,
    conn: ConnectionManager,
    prefix: String,
}

impl RedisCloud {
    /// Connect to `url`, namespacing every key under `prefix`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> CloudResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            prefix: prefix.into(),
        })
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    fn queue_ref(&self, name: &str) -> QueueRef {
        QueueRef {
            name: name.to_string(),
            url: self.key(&["queue", name]),
        }
    }

    async fn queue_exists(&self, name: &str) -> CloudResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("SISMEMBER")
            .arg(self.key(&["queues"]))
            .arg(name)
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl QueueService for RedisCloud {
    async fn define_queue(&self, name: &str) -> CloudResult<QueueRef> {
        let mut conn = self.conn.clone();
        redis::cmd("SADD")
            .arg(self.key(&["queues"]))
            .arg(name)
            .query_async::<_, i64>(&mut conn)
            .await?;
        tracing::debug!(queue = %name, "Queue defined");
        Ok(self.queue_ref(name))
    }

    async fn delete_queue(&self, queue: &QueueRef) -> CloudResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("SREM")
            .arg(self.key(&["queues"]))
            .arg(&queue.name)
            .ignore()
            .cmd("DEL")
            .arg(&queue.url)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        tracing::debug!(queue = %queue.name, "Queue deleted");
        Ok(())
    }

    async fn queue_id(&self, name: &str) -> CloudResult<Option<QueueRef>> {
        Ok(self
            .queue_exists(name)
            .await?
            .then(|| self.queue_ref(name)))
    }

    async fn list_queue_ids(&self, location: &str) -> CloudResult<Vec<QueueRef>> {
        let mut conn = self.conn.clone();
        let names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key(&["queues"]))
            .query_async(&mut conn)
            .await?;
        let prefix = instance_queue_prefix(location);
        let mut refs: Vec<QueueRef> = names
            .iter()
            .filter(|n| n.starts_with(&prefix))
            .map(|n| self.queue_ref(n))
            .collect();
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }

    async fn send_message(&self, queue: &QueueRef, json: &str) -> CloudResult<()> {
        if !self.queue_exists(&queue.name).await? {
            return Err(CloudError::QueueDoesNotExist(queue.name.clone()));
        }
        let mut conn = self.conn.clone();
        redis::cmd("RPUSH")
            .arg(&queue.url)
            .arg(json)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn receive_messages(&self, queue: &QueueRef, wait: Duration) -> CloudResult<Vec<String>> {
        if !self.queue_exists(&queue.name).await? {
            return Err(CloudError::QueueDoesNotExist(queue.name.clone()));
        }

        // BLPOP blocks the whole connection, so it gets its own
        let mut blocking = self.client.get_multiplexed_async_connection().await?;
        let first: Option<(String, String)> = if wait.is_zero() {
            redis::cmd("LPOP")
                .arg(&queue.url)
                .query_async::<_, Option<String>>(&mut blocking)
                .await?
                .map(|v| (queue.url.clone(), v))
        } else {
            redis::cmd("BLPOP")
                .arg(&queue.url)
                .arg(wait.as_secs_f64())
                .query_async(&mut blocking)
                .await?
        };

        let Some((_key, first)) = first else {
            return Ok(Vec::new());
        };

        let mut conn = self.conn.clone();
        let rest: Option<Vec<String>> = redis::cmd("LPOP")
            .arg(&queue.url)
            .arg(MAX_POLL_BATCH - 1)
            .query_async(&mut conn)
            .await?;

        let mut batch = vec![first];
        batch.extend(rest.unwrap_or_default());
        Ok(batch)
    }
}

#[async_trait]
impl KeyValueStore for RedisCloud {
    async fn store(&self, category: &str, key: &str, value: serde_json::Value) -> CloudResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(self.key(&["kv", category]))
            .arg(key)
            .arg(serde_json::to_string(&value)?)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn retrieve(&self, category: &str, key: &str) -> CloudResult<Option<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.key(&["kv", category]))
            .arg(key)
            .query_async(&mut conn)
            .await?;
        raw.map(|r| serde_json::from_str(&r).map_err(CloudError::from))
            .transpose()
    }

    async fn delete(&self, category: &str, key: &str) -> CloudResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("HDEL")
            .arg(self.key(&["kv", category]))
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn entries(&self, category: &str) -> CloudResult<Vec<(String, serde_json::Value)>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.key(&["kv", category]))
            .query_async(&mut conn)
            .await?;
        let mut entries = raw
            .into_iter()
            .map(|(k, v)| Ok((k, serde_json::from_str(&v)?)))
            .collect::<CloudResult<Vec<_>>>()?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[async_trait]
impl TableStore for RedisCloud {
    async fn has_table(&self, table: &str) -> CloudResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("SISMEMBER")
            .arg(self.key(&["tables"]))
            .arg(table)
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn create_table(&self, table: &str) -> CloudResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SADD")
            .arg(self.key(&["tables"]))
            .arg(table)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> CloudResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("SREM")
            .arg(self.key(&["tables"]))
            .arg(table)
            .ignore()
            .cmd("DEL")
            .arg(self.key(&["table", table]))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn list(&self, table: &str) -> CloudResult<Vec<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let rows: Vec<String> = redis::cmd("HVALS")
            .arg(self.key(&["table", table]))
            .query_async(&mut conn)
            .await?;
        rows.iter()
            .map(|r| serde_json::from_str(r).map_err(CloudError::from))
            .collect()
    }

    async fn get_row(&self, table: &str, key: &str) -> CloudResult<Option<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.key(&["table", table]))
            .arg(key)
            .query_async(&mut conn)
            .await?;
        raw.map(|r| serde_json::from_str(&r).map_err(CloudError::from))
            .transpose()
    }

    async fn save(&self, table: &str, key: &str, row: serde_json::Value) -> CloudResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("SADD")
            .arg(self.key(&["tables"]))
            .arg(table)
            .ignore()
            .cmd("HSET")
            .arg(self.key(&["table", table]))
            .arg(key)
            .arg(serde_json::to_string(&row)?)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_row(&self, table: &str, key: &str) -> CloudResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("HDEL")
            .arg(self.key(&["table", table]))
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl ModuleStore for RedisCloud {
    async fn upload_module(&self, archive: &str, bytes: Vec<u8>) -> CloudResult<()> {
        let checksum = archive_checksum(&bytes);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.key(&["archive", archive]))
            .arg(bytes)
            .ignore()
            .cmd("HSET")
            .arg(self.key(&["archive-meta", archive]))
            .arg("checksum")
            .arg(&checksum)
            .arg("installed_on")
            .arg(Utc::now().to_rfc3339())
            .ignore()
            .cmd("SADD")
            .arg(self.key(&["archives"]))
            .arg(archive)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        tracing::debug!(archive = %archive, checksum = %checksum, "Archive uploaded");
        Ok(())
    }

    async fn get_module(&self, archive: &str) -> CloudResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.key(&["archive", archive]))
            .query_async(&mut conn)
            .await?;
        Ok(bytes)
    }

    async fn remove_module(&self, archive: &str) -> CloudResult<bool> {
        let mut conn = self.conn.clone();
        let (removed,): (i64,) = redis::pipe()
            .atomic()
            .cmd("SREM")
            .arg(self.key(&["archives"]))
            .arg(archive)
            .cmd("DEL")
            .arg(self.key(&["archive", archive]))
            .ignore()
            .cmd("DEL")
            .arg(self.key(&["archive-meta", archive]))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn module_install_date(&self, archive: &str) -> CloudResult<Option<DateTime<Utc>>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.key(&["archive-meta", archive]))
            .arg("installed_on")
            .query_async(&mut conn)
            .await?;
        raw.map(|r| {
            DateTime::parse_from_rfc3339(&r)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| CloudError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn list_modules(&self) -> CloudResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key(&["archives"]))
            .query_async(&mut conn)
            .await?;
        names.sort();
        Ok(names)
    }

    async fn module_checksum(&self, archive: &str) -> CloudResult<Option<String>> {
        let mut conn = self.conn.clone();
        let checksum: Option<String> = redis::cmd("HGET")
            .arg(self.key(&["archive-meta", archive]))
            .arg("checksum")
            .query_async(&mut conn)
            .await?;
        Ok(checksum)
    }

    async fn module_configuration(&self, archive: &str) -> CloudResult<Option<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.key(&["archive-meta", archive]))
            .arg("configuration")
            .query_async(&mut conn)
            .await?;
        raw.map(|r| serde_json::from_str(&r).map_err(CloudError::from))
            .transpose()
    }

    async fn set_module_configuration(&self, archive: &str, configuration: serde_json::Value) -> CloudResult<()> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("SISMEMBER")
            .arg(self.key(&["archives"]))
            .arg(archive)
            .query_async(&mut conn)
            .await?;
        if !exists {
            return Err(CloudError::NotFound(archive.to_string()));
        }
        redis::cmd("HSET")
            .arg(self.key(&["archive-meta", archive]))
            .arg("configuration")
            .arg(serde_json::to_string(&configuration)?)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FleetHealth for RedisCloud {
    async fn watchdog(&self, location: &str, instance_id: Uuid, queue: &QueueRef) -> CloudResult<()> {
        let record = serde_json::json!({
            "location": location,
            "queue": queue,
            "lastSeen": Utc::now(),
        });
        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("SET")
            .arg(self.key(&["fleet", &instance_id.to_string()]))
            .arg(serde_json::to_string(&record)?)
            .arg("EX")
            .arg(HEARTBEAT_TTL_SECS)
            .ignore()
            .cmd("SADD")
            .arg(self.key(&["locations"]))
            .arg(location)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn locations(&self) -> CloudResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut locations: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key(&["locations"]))
            .query_async(&mut conn)
            .await?;
        locations.sort();
        Ok(locations)
    }
}

#[async_trait]
impl CloudBackend for RedisCloud {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> CloudResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
