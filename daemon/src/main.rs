use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use flow_daemon::{
    chain::ChainClients,
    config::Config,
    core::storage::SledStorage,
    events::EventBus,
    logger,
    rpc::{ApiConfig, ApiServer},
    tracker::FlowTracker,
    worker::{FlowWorker, JobQueue},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    logger::init(&config.log_level).context("Failed to initialize logger")?;
    info!("flowd v{}", flow_common::VERSION);

    let registry = config.load_registry()?;
    let polling = config.load_polling_configs()?;

    let db = sled::open(&config.data_dir)
        .with_context(|| format!("Failed to open data directory {}", config.data_dir))?;
    let store = Arc::new(SledStorage::new(db.clone()).context("Failed to open flow store")?);
    let queue = Arc::new(JobQueue::new(&db).context("Failed to open job queue")?);

    let clients = Arc::new(ChainClients::from_registry(&registry));
    let events = Arc::new(EventBus::new());
    let tracker = FlowTracker::new(store, clients, registry, polling, events);

    let worker = FlowWorker::new(Arc::clone(&tracker), queue);
    worker.start();
    let resumed = worker.resume_unfinished().await?;
    if resumed > 0 {
        info!("Enqueued {} resume jobs", resumed);
    }

    let api = ApiServer::new(
        Arc::clone(&tracker),
        Arc::clone(&worker),
        ApiConfig {
            bind_address: config.bind_address(),
            allowed_origins: config.allowed_origins(),
            prometheus_enabled: config.prometheus,
            prometheus_route: "/metrics".to_string(),
        },
    )
    .await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    api.stop().await;
    worker.stop().await;
    if let Err(e) = db.flush() {
        warn!("Failed to flush store on shutdown: {}", e);
    }
    info!("Goodbye");
    Ok(())
}
