//! Queue listeners and the worker pool they feed.
//!
//! Every instance listens on three queues: its own instance queue, the
//! location queue shared by its location, and the fleet-wide global queue.

pub mod listener;
pub mod worker_pool;

pub use listener::{is_dead, send_reply, ListenerStatus, QueueListener, QueueScope};
pub use worker_pool::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};
