//! Built-in modules shipped with the runtime.
//!
//! Useful for smoke-testing a deployment: upload an archive that exports
//! these classes and exercise each capability end to end.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::catalog::ModuleCatalog;
use super::{
    BatchTask, EventHandler, FixedTask, Module, ModuleContext, ModuleError, WebHandler,
    WebRequest, WebResponse,
};
use crate::message::Message;

pub const ECHO: &str = "gsm.builtin.Echo";
pub const COUNTER: &str = "gsm.builtin.Counter";
pub const HELLO: &str = "gsm.builtin.Hello";
pub const TICKER: &str = "gsm.builtin.Ticker";

pub fn register_all(catalog: &ModuleCatalog) {
    catalog.register(ECHO, |_| Ok(Arc::new(Echo) as Arc<dyn Module>));
    catalog.register(COUNTER, |_| Ok(Arc::new(Counter) as Arc<dyn Module>));
    catalog.register(HELLO, |decl| {
        let greeting = decl
            .config
            .get("greeting")
            .and_then(|g| g.as_str())
            .unwrap_or("Hello")
            .to_string();
        Ok(Arc::new(Hello { greeting }) as Arc<dyn Module>)
    });
    catalog.register(TICKER, |decl| {
        let period_ms = decl
            .config
            .get("period_ms")
            .and_then(|p| p.as_u64())
            .unwrap_or(1_000);
        if period_ms == 0 {
            return Err(ModuleError::InvalidInput("period_ms must be positive".into()));
        }
        Ok(Arc::new(Ticker {
            period: Duration::from_millis(period_ms),
        }) as Arc<dyn Module>)
    });
}

// ═══════════════════════════════════════════════════════════════════════════════
// Echo
// ═══════════════════════════════════════════════════════════════════════════════

/// Replies with the payload it received.
pub struct Echo;

#[async_trait]
impl EventHandler for Echo {
    async fn on_message(
        &self,
        _ctx: &ModuleContext,
        message: &Message,
    ) -> Result<Option<serde_json::Value>, ModuleError> {
        if message.payload.is_null() {
            return Ok(None);
        }
        Ok(Some(message.payload.clone()))
    }
}

impl Module for Echo {
    fn as_event(&self) -> Option<&dyn EventHandler> {
        Some(self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Counter
// ═══════════════════════════════════════════════════════════════════════════════

/// Counts messages and batch runs in its version's state arena.
pub struct Counter;

#[async_trait]
impl EventHandler for Counter {
    async fn on_message(
        &self,
        ctx: &ModuleContext,
        _message: &Message,
    ) -> Result<Option<serde_json::Value>, ModuleError> {
        let count = ctx.state().increment("messages");
        Ok(Some(serde_json::json!({ "messages": count })))
    }
}

#[async_trait]
impl BatchTask for Counter {
    async fn run_batch(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        let runs = ctx.state().increment("batch_runs");
        tracing::debug!(plugin_id = %ctx.plugin_id, runs, "Counter batch run");
        Ok(())
    }
}

impl Module for Counter {
    fn as_event(&self) -> Option<&dyn EventHandler> {
        Some(self)
    }

    fn as_batch(&self) -> Option<&dyn BatchTask> {
        Some(self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Hello
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Hello {
    greeting: String,
}

#[async_trait]
impl WebHandler for Hello {
    async fn handle(&self, ctx: &ModuleContext, request: WebRequest) -> Result<WebResponse, ModuleError> {
        Ok(WebResponse::json(&serde_json::json!({
            "greeting": self.greeting,
            "pluginId": ctx.plugin_id,
            "version": ctx.version.to_string(),
            "path": request.subpath,
            "method": request.method.as_str(),
        })))
    }
}

impl Module for Hello {
    fn as_web(&self) -> Option<&dyn WebHandler> {
        Some(self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Ticker
// ═══════════════════════════════════════════════════════════════════════════════

/// Records a heartbeat in its state arena until shut down.
pub struct Ticker {
    period: Duration,
}

#[async_trait]
impl FixedTask for Ticker {
    async fn run(&self, ctx: &ModuleContext, shutdown: CancellationToken) -> Result<(), ModuleError> {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = interval.tick() => {
                    ctx.state().increment("ticks");
                }
            }
        }
    }
}

impl Module for Ticker {
    fn as_fixed(&self) -> Option<&dyn FixedTask> {
        Some(self)
    }
}
