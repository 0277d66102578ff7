//! # Server Instance
//!
//! Owns one process's share of the fleet: its identity, the plugin
//! manager, the three queue listeners, the scheduler ticker, the watchdog
//! and the HTTP server. Everything is wired explicitly in [`ServerInstance::init`];
//! there is no process-wide singleton.
//!
//! Startup order:
//!
//! 1. define the global and location queues, create the instance queue
//! 2. first watchdog heartbeat (registers the location with the fleet)
//! 3. load virtual hosts, start fixed modules
//! 4. start the instance, location and global listeners
//! 5. start the scheduler ticker and the watchdog loop
//! 6. bind and serve HTTP
//!
//! Shutdown reverses it and finally deletes the instance queue.

pub mod instance;

pub use instance::InstanceIdentity;

use axum::Router;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::cloud::{location_queue_name, CloudBackend, QueueRef};
use crate::config::Config;
use crate::error::{GsmError, Result};
use crate::health::{
    BackendHealthChecker, HealthConfig, HealthService, ListenerHealthChecker,
    PluginGuardHealthChecker, WorkerPoolHealthChecker,
};
use crate::manager::{ExitStrategy, PluginManager, SchedulerHook};
use crate::modules::ModuleCatalog;
use crate::queue::{QueueListener, QueueScope, WorkerPool, WorkerPoolConfig};
use crate::scheduler::{BatchScheduler, Watchdog};
use crate::telemetry::MetricsRegistry;

/// Handles that exist only between `start` and `stop`.
struct Running {
    listeners: Vec<Arc<QueueListener>>,
    listener_tasks: Vec<JoinHandle<()>>,
    background_tasks: Vec<JoinHandle<()>>,
    instance_queue: Arc<RwLock<QueueRef>>,
    watchdog: Arc<Watchdog>,
    app: AppState,
    http_addr: SocketAddr,
}

pub struct ServerInstance {
    config: Config,
    identity: InstanceIdentity,
    backend: Arc<dyn CloudBackend>,
    manager: Arc<PluginManager>,
    scheduler: Arc<BatchScheduler>,
    pool: Arc<WorkerPool>,
    metrics: MetricsRegistry,
    shutdown: CancellationToken,
    started_at: Instant,
    running: Mutex<Option<Running>>,
}

impl ServerInstance {
    pub fn init(
        config: Config,
        backend: Arc<dyn CloudBackend>,
        catalog: Arc<ModuleCatalog>,
        exit: Arc<dyn ExitStrategy>,
    ) -> Result<Self> {
        let identity =
            InstanceIdentity::load_or_create(&config.instance.id_file_dir(), &config.instance.id_file_name)?;
        let shutdown = CancellationToken::new();

        let manager = Arc::new(
            PluginManager::new(
                config.plugins.clone(),
                identity.id,
                config.instance.location.clone(),
                Arc::clone(&backend),
                catalog,
                exit,
            )?
            .with_global_queue(config.queues.global_queue.clone())
            .with_shutdown(shutdown.child_token()),
        );

        let scheduler = Arc::new(BatchScheduler::new(Arc::clone(&manager), config.scheduler.clone()));
        let hook: Weak<dyn SchedulerHook> = Arc::downgrade(&scheduler) as Weak<dyn SchedulerHook>;
        manager.attach_scheduler(hook);

        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig::from_queue_config(&config.queues).with_name("dispatch"),
        ));

        info!(
            instance_id = %identity.id,
            location = %config.instance.location,
            backend = backend.name(),
            "Server instance initialized"
        );

        Ok(Self {
            config,
            identity,
            backend,
            manager,
            scheduler,
            pool,
            metrics: MetricsRegistry::disabled(),
            shutdown,
            started_at: Instant::now(),
            running: Mutex::new(None),
        })
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = metrics;
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    pub fn scheduler(&self) -> &Arc<BatchScheduler> {
        &self.scheduler
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.http_addr)
    }

    pub fn listeners(&self) -> Vec<Arc<QueueListener>> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.listeners.clone())
            .unwrap_or_default()
    }

    pub fn instance_queue(&self) -> Option<QueueRef> {
        self.running.lock().as_ref().map(|r| r.instance_queue.read().clone())
    }

    pub fn watchdog(&self) -> Option<Arc<Watchdog>> {
        self.running.lock().as_ref().map(|r| Arc::clone(&r.watchdog))
    }

    /// The HTTP router of a started instance.
    pub fn router(&self) -> Option<Router> {
        self.running
            .lock()
            .as_ref()
            .map(|r| api::build_router(r.app.clone()))
    }

    // ═════════════════════════════════════════════════════════════════════════
    // Start
    // ═════════════════════════════════════════════════════════════════════════

    /// Bring the instance up; returns the bound HTTP address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.is_running() {
            return Err(GsmError::validation("server instance already started"));
        }
        let location = self.manager.location().to_string();
        let instance_id = self.identity.id;

        // Every fallible step runs before the first task is spawned.
        let bind = format!("{}:{}", self.config.server.host, self.config.server.port);
        let tcp = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| GsmError::configuration(format!("cannot bind {}: {}", bind, e)))?;
        let http_addr = tcp.local_addr()?;

        let global_queue = self.backend.define_queue(&self.config.queues.global_queue).await?;
        let location_queue = self.backend.define_queue(&location_queue_name(&location)).await?;
        let instance_queue = self.backend.create_instance_queue(&location, instance_id).await?;
        info!(
            instance_queue = %instance_queue.name,
            location_queue = %location_queue.name,
            global_queue = %global_queue.name,
            "Queues ready"
        );

        let instance_listener = Arc::new(self.listener(QueueScope::Instance, instance_queue));
        let queue_handle = instance_listener.queue_handle();
        let watchdog = Arc::new(Watchdog::new(
            Arc::clone(&self.backend),
            location.clone(),
            instance_id,
            Arc::clone(&queue_handle),
            self.config.scheduler.watchdog_interval,
        ));
        if let Err(e) = watchdog.beat().await {
            warn!(error = %e, "Initial fleet registration failed, the watchdog will retry");
        }

        match self.manager.reload_virtual_hosts().await {
            Ok(count) => info!(virtual_hosts = count, "Virtual hosts loaded"),
            Err(e) => warn!(error = %e, "Virtual hosts unavailable at startup"),
        }
        let fixed = self.manager.start_fixed_modules().await;
        info!(fixed_modules = fixed, "Fixed modules started");

        let listeners = vec![
            instance_listener,
            Arc::new(self.listener(QueueScope::Location, location_queue)),
            Arc::new(self.listener(QueueScope::Global, global_queue)),
        ];
        let listener_tasks = listeners
            .iter()
            .map(|l| tokio::spawn(Arc::clone(l).run(self.shutdown.child_token())))
            .collect();

        let mut background_tasks = vec![
            tokio::spawn(Arc::clone(&self.scheduler).run(self.shutdown.child_token())),
            tokio::spawn(Arc::clone(&watchdog).run(self.shutdown.child_token())),
        ];

        let app = AppState {
            manager: Arc::clone(&self.manager),
            scheduler: Arc::clone(&self.scheduler),
            health: Arc::new(self.health_service(&listeners)),
            pool: Arc::clone(&self.pool),
            metrics: self.metrics.clone(),
            admin: Arc::new(self.config.admin.clone()),
            started_at: self.started_at,
        };

        let router = api::build_router(app.clone());
        let token = self.shutdown.child_token();
        background_tasks.push(tokio::spawn(async move {
            let served = axum::serve(tcp, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "HTTP server failed");
            }
        }));

        info!(address = %http_addr, instance_id = %instance_id, location = %location, "Server instance started");

        *self.running.lock() = Some(Running {
            listeners,
            listener_tasks,
            background_tasks,
            instance_queue: queue_handle,
            watchdog,
            app,
            http_addr,
        });
        Ok(http_addr)
    }

    fn listener(&self, scope: QueueScope, queue: QueueRef) -> QueueListener {
        QueueListener::new(
            scope,
            queue,
            Arc::clone(&self.manager),
            Arc::clone(&self.pool),
            &self.config.queues,
        )
    }

    fn health_service(&self, listeners: &[Arc<QueueListener>]) -> HealthService {
        let mut health = HealthService::new(HealthConfig::default());
        health.register_checker(Arc::new(BackendHealthChecker::new(Arc::clone(&self.backend))));
        health.register_checker(Arc::new(ListenerHealthChecker::new(listeners.to_vec())));
        health.register_checker(Arc::new(WorkerPoolHealthChecker::new(Arc::clone(&self.pool))));
        health.register_checker(Arc::new(PluginGuardHealthChecker::new(Arc::clone(&self.manager))));
        health
    }

    // ═════════════════════════════════════════════════════════════════════════
    // Stop
    // ═════════════════════════════════════════════════════════════════════════

    /// Stop every task and delete the instance queue. A second call is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };
        let grace = self.config.server.shutdown_grace;
        info!(grace_secs = grace.as_secs(), "Stopping server instance");
        self.shutdown.cancel();

        await_or_abort("listeners", running.listener_tasks, grace).await;
        self.pool.drain(grace).await;
        self.manager.fixed().stop_all(grace).await;
        await_or_abort("background", running.background_tasks, grace).await;

        let queue = running.instance_queue.read().clone();
        if let Err(e) = self.backend.delete_queue(&queue).await {
            warn!(queue = %queue.name, error = %e, "Failed to delete instance queue");
        }

        info!(instance_id = %self.identity.id, "Server instance stopped");
        Ok(())
    }
}

/// Wait up to `grace` for `tasks`, then abort whatever is still running.
async fn await_or_abort(group: &str, tasks: Vec<JoinHandle<()>>, grace: Duration) {
    let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
    if tokio::time::timeout(grace, futures::future::join_all(tasks)).await.is_err() {
        warn!(group = group, "Tasks still running after grace period, aborting");
        for abort in aborts {
            abort.abort();
        }
    }
}
