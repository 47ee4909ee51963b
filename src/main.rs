use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use seatwise::config::Config;
use seatwise::directory::InMemoryDirectory;
use seatwise::engine::Engine;
use seatwise::jobs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    seatwise::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let directory = match &config.directory_file {
        Some(path) => {
            let dir = InMemoryDirectory::load_json(path)?;
            info!("loaded {} directory entries from {}", dir.len(), path.display());
            dir
        }
        None => {
            tracing::warn!("SEATWISE_DIRECTORY_FILE not set, every existence check will fail");
            InMemoryDirectory::new()
        }
    };

    let wal_path = config.data_dir.join("seatwise.wal");
    let engine = Arc::new(Engine::new(wal_path, Arc::new(directory))?);

    info!("seatwise started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  compact_threshold: {}", config.compact_threshold);
    info!("  expire_interval: {:?}", config.expire_interval);
    info!("  reconcile_interval: {:?}", config.reconcile_interval);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let tasks = [
        tokio::spawn(jobs::run_expirer(engine.clone(), config.expire_interval)),
        tokio::spawn(jobs::run_reconciler(engine.clone(), config.reconcile_interval)),
        tokio::spawn(jobs::run_compactor(engine.clone(), config.compact_threshold)),
    ];

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }
    info!("shutdown signal received, stopping background jobs");

    for task in &tasks {
        task.abort();
    }
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("seatwise stopped");
    Ok(())
}
