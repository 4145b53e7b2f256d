use chime_grid::NatsGrid;
use chime_node::{config::NodeConfig, driver::Driver, signaler::LoggingSignaler};
use chime_store::{ClusteredJobStore, JobStore};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = NodeConfig::from_env().expect("failed to load configuration");
    tracing::info!(node = %config.store.node_address, "Loaded configuration");

    // Connect to the grid
    let grid = NatsGrid::connect(config.nats.clone())
        .await
        .expect("failed to connect to NATS grid");

    let store = ClusteredJobStore::new(Arc::new(grid), config.store.clone());
    store
        .initialize(Arc::new(LoggingSignaler))
        .await
        .expect("failed to initialize trigger store");
    store
        .scheduler_started()
        .await
        .expect("failed to start trigger store");

    // Spawn the driver loop
    let (stop_tx, stop_rx) = watch::channel(false);
    let driver = Driver::new(Arc::new(store.clone()), config.driver.clone());
    let driver_task = tokio::spawn(driver.run(stop_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down");

    // The driver may already be gone, in which case there is nothing to stop.
    let _ = stop_tx.send(true);
    if let Err(e) = driver_task.await {
        tracing::warn!(error = %e, "Driver task failed");
    }
    store.shutdown().await;
}
