//! GSM Server - Main entry point

use std::sync::Arc;

use gsm_core::{
    cloud,
    config::Config,
    manager::ProcessExit,
    modules::ModuleCatalog,
    server::ServerInstance,
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = match std::env::var("GSM_CONFIG_FILE") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };

    let metrics = telemetry::init_telemetry(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        location = %config.instance.location,
        "Starting GSM server"
    );

    let backend = cloud::connect(&config.backend).await?;
    let catalog = Arc::new(ModuleCatalog::with_builtins());

    let server = ServerInstance::init(config, backend, catalog, Arc::new(ProcessExit))?
        .with_metrics(metrics);
    let addr = server.start().await?;
    tracing::info!(address = %addr, "Serving HTTP");

    shutdown_signal().await;

    server.stop().await?;
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
