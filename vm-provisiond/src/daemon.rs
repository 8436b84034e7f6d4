use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{info, warn};
use vm_orchestrator::db::{backup_database, create_pool, run_migrations};
use vm_orchestrator::{start_sweeper_task, JobQueue, LogNotifier, ProvisioningWorker};

use crate::commands::Services;
use crate::config::Config;

/// Back up, open and migrate the database.
pub async fn open_database(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db_path;
    info!("Database path: {}", db_path.display());

    // Backup before migrations
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    Ok(pool)
}

/// The infrastructure tool must be installed; the wrapper is optional.
pub fn preflight(config: &Config) -> Result<()> {
    let terraform = which::which(&config.terraform_bin)
        .with_context(|| format!("'{}' not found on PATH", config.terraform_bin))?;
    info!("Using {}", terraform.display());

    match which::which(&config.terragrunt_bin) {
        Ok(path) => info!("Using {}", path.display()),
        Err(_) => warn!(
            "'{}' not found; module-based requests will fail at init",
            config.terragrunt_bin
        ),
    }
    Ok(())
}

/// Run the worker and sweeper until ctrl-c, then drain in-flight jobs.
pub async fn serve(config: Config) -> Result<()> {
    info!("Starting provisiond...");
    info!("Configuration loaded: {:?}", config);

    preflight(&config)?;
    let pool = open_database(&config).await?;

    let (queue, jobs) = JobQueue::new(config.queue_capacity);
    let services = Services::new(
        pool.clone(),
        queue.clone(),
        Arc::new(config.executor()),
        Arc::new(LogNotifier),
        config.pipeline_settings(),
    );

    let recovered = services.pipeline.recover_interrupted().await?;
    if recovered > 0 {
        warn!("Marked {} interrupted request(s) as failed", recovered);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ProvisioningWorker::new(Arc::clone(&services.pipeline), config.worker_concurrency)
        .spawn(jobs, shutdown_rx.clone());
    info!(
        "Provisioning worker started (concurrency: {})",
        config.worker_concurrency
    );

    let sweeper = tokio::spawn(start_sweeper_task(
        pool,
        queue,
        config.sweeper_interval_secs,
        shutdown_rx,
    ));
    info!(
        "Sweeper task started (interval: {}s)",
        config.sweeper_interval_secs
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for in-flight jobs");

    // Receivers live in the spawned tasks, so the send only fails once both exited.
    let _ = shutdown_tx.send(true);
    sweeper.await?;
    worker.await?;

    info!("provisiond stopped");
    Ok(())
}
