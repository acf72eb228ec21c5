use anyhow::Context;
use healthgate::config::ServiceConfig;
use healthgate::server::{shutdown_channel, LifecycleManager, TerminationSignals};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting healthgate");

    let config = ServiceConfig::from_env();
    info!(
        port = config.port,
        shutdown_timeout = ?config.shutdown_timeout,
        primary_uri = %config.primary_uri,
        cache_addr = %config.cache_addr,
        "Configuration loaded"
    );

    // Signal handlers are registered before any dependency is opened
    let mut signals =
        TerminationSignals::register().context("Failed to register signal handlers")?;

    let mut manager = LifecycleManager::from_config(config);
    manager.start().await.context("Failed to start service")?;

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    tokio::spawn(async move {
        let signal = signals.recv().await;
        info!(signal = signal, "Initiating graceful shutdown");
        shutdown_controller.shutdown();
    });

    manager
        .run(shutdown_signal)
        .await
        .context("Service terminated with error")?;

    info!("healthgate shut down gracefully");
    Ok(())
}
