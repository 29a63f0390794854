use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use run_summary::blob::BlobStoreFactory;
use run_summary::config::{Command, Config};
use run_summary::retention::{RetentionCoordinator, RetentionPolicy};
use run_summary::{Database, logging};

/// Deadline of each periodic health ping
const HEALTH_PING_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_args();

    // Handle version subcommand
    if let Some(Command::Version) = &config.command {
        println!(
            "run-summary {}, commit: {}, build_date: {}",
            env!("CARGO_PKG_VERSION"),
            env!("RUN_SUMMARY_GIT_SHA"),
            env!("RUN_SUMMARY_BUILD_DATE"),
        );
        println!("target: {}", env!("RUN_SUMMARY_TARGET"));
        return Ok(());
    }

    logging::init(config.log_format, &config.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("RUN_SUMMARY_GIT_SHA"),
        build_date = env!("RUN_SUMMARY_BUILD_DATE"),
        driver = %config.db_driver,
        database_url = %config.redacted_database_url(),
        blob_store = %config.blob_store,
        "run-summary starting"
    );

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }

    let database = Database::connect(
        config.db_driver,
        &config.database_url,
        &config.backend_options(),
    )
    .await
    .context("Failed to connect storage backend")?
    .with_query_timeout(config.query_timeout());

    let blobs = BlobStoreFactory::create(&config.blob_config())
        .await
        .context("Failed to create blob store")?;

    let coordinator = RetentionCoordinator::new(database.clone(), Arc::clone(&blobs));

    let result = match config.command() {
        Command::Purge { days } => run_purge(&coordinator, days).await,
        Command::Serve | Command::Version => serve(&config, &database, coordinator).await,
    };

    if let Err(e) = database.close().await {
        warn!(error = %e, "Failed to close storage backend");
    }

    if let Err(e) = result {
        error!(error = %e, "Application error");
        std::process::exit(1);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn run_purge(coordinator: &RetentionCoordinator, days: i64) -> Result<()> {
    let policy = RetentionPolicy::from_days(days);
    match coordinator.purge(policy).await.context("Purge failed")? {
        Some(outcome) => info!(
            cutoff = %outcome.cutoff,
            records = outcome.records,
            blobs = outcome.blobs,
            "Purge finished"
        ),
        None => info!(days, "Purge skipped"),
    }
    Ok(())
}

async fn serve(
    config: &Config,
    database: &Database,
    coordinator: RetentionCoordinator,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health_db = database.clone();
    let health_interval = config.health_check_interval();
    let health_rx = shutdown_rx.clone();
    let health = tokio::spawn(async move {
        health_db
            .watch_health(health_interval, HEALTH_PING_DEADLINE, health_rx)
            .await;
    });

    let policy = RetentionPolicy::from_days(config.retention_days);
    let purge_hour = config.purge_hour;
    let retention_rx = shutdown_rx.clone();
    let retention = tokio::spawn(async move {
        coordinator.run(policy, purge_hour, retention_rx).await;
    });

    info!(
        retention = ?policy,
        purge_hour,
        health_check_interval_secs = health_interval.as_secs(),
        "Serving"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");
    if let Err(e) = shutdown_tx.send(true) {
        debug!(error = %e, "No background task was listening for shutdown");
    }

    for (name, task) in [("health", health), ("retention", retention)] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "Background task ended abnormally");
        }
    }
    Ok(())
}
