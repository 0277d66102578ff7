#![allow(clippy::result_large_err)]
//! # GSM Core
//!
//! Cloud-portable microkernel runtime hosting dynamically deployed plugin
//! modules across a fleet of server instances grouped into locations.
//!
//! ## Architecture
//!
//! - **Cloud**: queue, key-value, table, archive and fleet-health traits with
//!   in-memory and Redis backends
//! - **Modules**: manifests, the module catalog, per-version isolation units and
//!   the live module cache
//! - **Manager**: install/delete, message and HTTP dispatch, timeout and memory
//!   guards, virtual hosts, fixed tasks, monitoring windows
//! - **Queue**: one listener per queue scope feeding a bounded worker pool
//! - **Scheduler**: leader-less batch triggering and the fleet heartbeat
//! - **Server**: explicit lifecycle owner wiring everything together
//! - **API**: health, metrics, admin and module routes over axum

pub mod api;
pub mod cloud;
pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod message;
pub mod modules;
pub mod queue;
pub mod scheduler;
pub mod server;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, GsmError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cloud::{CloudBackend, InMemoryCloud, QueueRef, RedisCloud};
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, GsmError, Result};
    pub use crate::manager::{ExitStrategy, PluginManager, ProcessExit, RecordingExit};
    pub use crate::message::{Message, PluginId, PluginVersion, SystemCommand};
    pub use crate::modules::{
        BatchTask, EventHandler, FixedTask, Module, ModuleCatalog, ModuleContext, ModuleError,
        WebHandler, WebRequest, WebResponse,
    };
    pub use crate::queue::{QueueListener, QueueScope, WorkerPool};
    pub use crate::scheduler::{BatchScheduler, TickOutcome};
    pub use crate::server::{InstanceIdentity, ServerInstance};
}
