//! Capstan worker process
//!
//! Bootstrap order matters: recover on-disk runs before the first connection
//! so `list` never under-reports, then run the link and synchronization loops
//! until a signal or a master-issued shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capstan_worker::config::WorkerConfig;
use capstan_worker::link::{LinkHandle, MasterLink, MasterRunClient};
use capstan_worker::state::StateDir;
use capstan_worker::worker::Worker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "capstan_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env()?;
    config.validate()?;
    info!(worker = %config.worker_id, master = %config.master_addr, "Starting Capstan worker");

    tokio::fs::create_dir_all(&config.state_dir)
        .await
        .with_context(|| format!("creating state directory {}", config.state_dir.display()))?;
    tokio::fs::create_dir_all(&config.workspace_dir)
        .await
        .with_context(|| format!("creating workspace {}", config.workspace_dir.display()))?;

    let state = Arc::new(StateDir::new(config.state_dir.clone()));
    let link_handle = LinkHandle::new();
    let client = Arc::new(MasterRunClient::new(link_handle.clone()));
    let worker = Worker::new(config.clone(), state, client.clone(), client);

    let recovered = worker.recover().await?;
    if recovered > 0 {
        info!(count = recovered, "recovered runs from previous process");
    }

    let stop = CancellationToken::new();
    let link = MasterLink::new(
        config.clone(),
        worker.clone(),
        link_handle.clone(),
        stop.clone(),
    );
    let link_task = tokio::spawn(async move { link.run().await });
    let sync_task = tokio::spawn(
        Arc::clone(&worker).sync_loop(link_handle.clone(), stop.clone()),
    );

    let shutdown = worker.shutdown_token();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for shutdown signal")?;
            info!("shutdown signal received");
        }
        _ = shutdown.cancelled() => {
            info!("shutdown requested by master");
        }
    }

    worker.terminate_all().await;

    // One last push so the master sees the final statuses if still connected
    if let Some(messenger) = link_handle.messenger() {
        worker.sync_tick(&messenger).await;
    }

    stop.cancel();
    let _ = link_task.await;
    let _ = sync_task.await;

    info!("Capstan worker stopped");
    Ok(())
}
