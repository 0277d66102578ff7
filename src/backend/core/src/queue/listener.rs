//! Poll loop for one queue.
//!
//! A listener polls its queue until its cancellation token fires, handing
//! each message to the worker pool. The dead state is derived from the
//! last poll timestamp alone.

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::worker_pool::WorkerPool;
use crate::cloud::{instance_queue_name, CloudBackend, CloudError, QueueRef};
use crate::config::QueueConfig;
use crate::error::Result;
use crate::manager::PluginManager;
use crate::message::Message;

/// Pause after a transient poll failure.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueScope {
    Instance,
    Location,
    Global,
}

impl QueueScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueScope::Instance => "instance",
            QueueScope::Location => "location",
            QueueScope::Global => "global",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatus {
    pub scope: QueueScope,
    pub queue: String,
    pub last_poll: DateTime<Utc>,
    pub polls: u64,
    pub received: u64,
    pub queue_recreations: u64,
    pub dead: bool,
}

pub struct QueueListener {
    scope: QueueScope,
    queue: Arc<RwLock<QueueRef>>,
    backend: Arc<dyn CloudBackend>,
    manager: Arc<PluginManager>,
    pool: Arc<WorkerPool>,
    poll_wait: Duration,
    missing_queue_retry: Duration,
    dead_threshold: Duration,
    /// Milliseconds since the epoch
    last_poll: AtomicI64,
    polls: AtomicU64,
    received: AtomicU64,
    recreations: AtomicU64,
}

impl QueueListener {
    pub fn new(
        scope: QueueScope,
        queue: QueueRef,
        manager: Arc<PluginManager>,
        pool: Arc<WorkerPool>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            scope,
            queue: Arc::new(RwLock::new(queue)),
            backend: Arc::clone(manager.backend()),
            manager,
            pool,
            poll_wait: config.poll_wait,
            missing_queue_retry: config.missing_queue_retry,
            dead_threshold: config.dead_threshold,
            last_poll: AtomicI64::new(Utc::now().timestamp_millis()),
            polls: AtomicU64::new(0),
            received: AtomicU64::new(0),
            recreations: AtomicU64::new(0),
        }
    }

    pub fn scope(&self) -> QueueScope {
        self.scope
    }

    pub fn queue(&self) -> QueueRef {
        self.queue.read().clone()
    }

    /// Shared handle that follows queue re-creation.
    pub fn queue_handle(&self) -> Arc<RwLock<QueueRef>> {
        Arc::clone(&self.queue)
    }

    pub fn last_poll(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.last_poll.load(Ordering::SeqCst)).unwrap_or_else(Utc::now)
    }

    pub fn set_last_poll(&self, at: DateTime<Utc>) {
        self.last_poll.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn is_dead(&self) -> bool {
        self.is_dead_at(Utc::now())
    }

    pub fn is_dead_at(&self, now: DateTime<Utc>) -> bool {
        is_dead(self.last_poll(), now, self.dead_threshold)
    }

    pub fn status(&self) -> ListenerStatus {
        ListenerStatus {
            scope: self.scope,
            queue: self.queue.read().name.clone(),
            last_poll: self.last_poll(),
            polls: self.polls.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            queue_recreations: self.recreations.load(Ordering::Relaxed),
            dead: self.is_dead(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Poll Loop
    // ─────────────────────────────────────────────────────────────────────────

    /// Poll until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(scope = self.scope.as_str(), queue = %self.queue().name, "Queue listener started");

        while !shutdown.is_cancelled() {
            self.set_last_poll(Utc::now());
            self.polls.fetch_add(1, Ordering::Relaxed);

            let queue = self.queue();
            let inbox = Mutex::new(Vec::new());
            let collect = |raw: String| inbox.lock().push(raw);
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.backend.poll_queue(&queue, self.poll_wait, &collect) => polled,
            };

            match polled {
                Ok(0) => {}
                Ok(count) => {
                    self.received.fetch_add(count as u64, Ordering::Relaxed);
                    let messages = std::mem::take(&mut *inbox.lock());
                    for raw in messages {
                        self.dispatch(&queue, raw).await;
                    }
                }
                Err(CloudError::QueueDoesNotExist(name)) => {
                    counter!("gsm_queue_poll_errors_total", "scope" => self.scope.as_str(), "kind" => "missing")
                        .increment(1);
                    warn!(
                        scope = self.scope.as_str(),
                        queue = %name,
                        retry_secs = self.missing_queue_retry.as_secs(),
                        "Queue does not exist, retrying in {}s",
                        self.missing_queue_retry.as_secs()
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.missing_queue_retry) => {}
                    }
                    if let Err(e) = self.recreate_queue().await {
                        warn!(scope = self.scope.as_str(), error = %e, "Queue re-creation failed");
                    }
                }
                Err(e) => {
                    counter!("gsm_queue_poll_errors_total", "scope" => self.scope.as_str(), "kind" => "transient")
                        .increment(1);
                    warn!(scope = self.scope.as_str(), queue = %queue.name, error = %e, "Queue poll failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!(scope = self.scope.as_str(), queue = %self.queue().name, "Queue listener stopped");
    }

    /// Define the queue again and record the new handle.
    pub async fn recreate_queue(&self) -> Result<QueueRef> {
        let queue = match self.scope {
            QueueScope::Instance => {
                self.backend
                    .create_instance_queue(self.manager.location(), self.manager.instance_id())
                    .await?
            }
            QueueScope::Location | QueueScope::Global => {
                let name = self.queue().name;
                self.backend.define_queue(&name).await?
            }
        };
        *self.queue.write() = queue.clone();
        self.recreations.fetch_add(1, Ordering::Relaxed);
        info!(scope = self.scope.as_str(), queue = %queue.name, url = %queue.url, "Queue re-created");
        Ok(queue)
    }

    async fn dispatch(&self, queue: &QueueRef, raw: String) {
        let mut message = match Message::from_json(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(scope = self.scope.as_str(), error = %e, "Discarding undecodable message");
                return;
            }
        };
        message.arrive_at(self.manager.instance_id(), self.manager.location());

        let manager = Arc::clone(&self.manager);
        let submitted = self
            .pool
            .submit(async move { handle_message(manager, message).await })
            .await;

        if let Err(e) = submitted {
            warn!(scope = self.scope.as_str(), error = %e, "Worker pool saturated, returning message to queue");
            if let Err(e) = self.backend.send_message(queue, &raw).await {
                error!(scope = self.scope.as_str(), error = %e, "Message lost after failed redrive");
            }
        }
    }
}

/// Dead once the last poll is more than `threshold` in the past.
pub fn is_dead(last_poll: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    now.signed_duration_since(last_poll)
        .to_std()
        .map(|since| since > threshold)
        .unwrap_or(false)
}

async fn handle_message(manager: Arc<PluginManager>, message: Message) -> Result<()> {
    match manager.process(&message).await {
        Ok(Some(reply)) => send_reply(&manager, &reply).await,
        Ok(None) => Ok(()),
        Err(e) => {
            error!(
                plugin_id = %message.plugin_id,
                module_class = %message.module_class,
                message_id = %message.id,
                error = %e,
                "Queue message failed"
            );
            Err(e)
        }
    }
}

/// Send `reply` to the instance queue of its addressee.
pub async fn send_reply(manager: &PluginManager, reply: &Message) -> Result<()> {
    let (Some(instance), Some(location)) = (reply.current_instance, reply.current_location.as_deref())
    else {
        debug!(message_id = %reply.id, "Reply has no addressee, dropped");
        return Ok(());
    };

    let name = instance_queue_name(location, instance);
    let backend = manager.backend();
    match backend.queue_id(&name).await? {
        Some(queue) => {
            backend.send_message(&queue, &reply.to_json()?).await?;
            debug!(queue = %name, plugin_id = %reply.plugin_id, "Reply sent");
        }
        None => warn!(queue = %name, "Requesting instance queue is gone, reply dropped"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_dead_is_a_function_of_last_poll() {
        let now = Utc::now();
        let threshold = Duration::from_secs(2 * 60 * 60);

        assert!(!is_dead(now, now, threshold));
        assert!(!is_dead(now - chrono::Duration::minutes(119), now, threshold));
        assert!(is_dead(now - chrono::Duration::minutes(121), now, threshold));
        assert!(!is_dead(now + chrono::Duration::minutes(5), now, threshold));
    }
}
