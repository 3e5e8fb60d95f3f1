//! Capstan master process
//!
//! Thin bootstrap: wire stores, supervisor, and scheduler together, serve
//! until a shutdown signal, then cancel background loops with a bounded wait.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capstan_master::auth::StaticAuthorizer;
use capstan_master::config::MasterConfig;
use capstan_master::scheduler::JobScheduler;
use capstan_master::selector::WorkerSelector;
use capstan_master::store::{MemoryJobStore, MemoryRunStore, MemoryWorkerStore};
use capstan_master::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "capstan_master=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Capstan master");

    let config = MasterConfig::from_env();
    config.validate()?;
    info!(bind_addr = %config.bind_addr, "loaded configuration");

    // Database-backed stores plug in here; the defaults are in-memory
    let run_store = Arc::new(MemoryRunStore::new());
    let job_store = Arc::new(MemoryJobStore::new());
    let worker_store = Arc::new(MemoryWorkerStore::new());

    let token = std::env::var("MASTER_TOKEN").unwrap_or_else(|_| "capstan".to_string());
    let owner = std::env::var("MASTER_OWNER").unwrap_or_else(|_| "admin".to_string());
    let authorizer = Arc::new(StaticAuthorizer::new().with_token(token, owner));

    let supervisor = Supervisor::new(
        config.clone(),
        run_store.clone(),
        worker_store.clone(),
        authorizer,
    );
    let selector = WorkerSelector::new(Arc::clone(&supervisor), worker_store.clone());
    let scheduler = JobScheduler::new(
        run_store,
        job_store,
        Arc::clone(&supervisor),
        selector,
        config.scheduler_interval,
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;

    let cancel = CancellationToken::new();
    let serve = tokio::spawn(Arc::clone(&supervisor).serve(listener, cancel.clone()));
    let tick = tokio::spawn(Arc::clone(&supervisor).update_loop(cancel.clone()));
    let schedule = {
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("shutdown signal received");
    cancel.cancel();

    let drain = async {
        let _ = serve.await;
        let _ = tick.await;
        let _ = schedule.await;
    };
    if tokio::time::timeout(config.shutdown_timeout, drain).await.is_err() {
        warn!("background loops did not stop in time, exiting anyway");
    }

    info!("Capstan master stopped");
    Ok(())
}
