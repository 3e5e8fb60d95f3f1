//! Run execution
//!
//! `run()` owns the run's status lifecycle on disk: pending to running with a
//! start timestamp, then one terminal status with a completion timestamp,
//! whatever the implementation did. The implementations only decide the
//! outcome; they never write status themselves.

mod job;
mod pipeline;

pub use job::JobExecutor;
pub use pipeline::{PipelineExecutor, RunLookup, RunTrigger};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use capstan_core::domain::{JobDefinition, RunStatus};
use capstan_core::dto::ExecuteRequest;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::state::{StateDir, StatusDoc};

/// Everything an execution needs, bundled so implementations stay small
pub struct ExecutionContext {
    pub request: ExecuteRequest,
    pub state: Arc<StateDir>,
    /// Per-run working directory for spawned commands
    pub workspace: PathBuf,
    pub abort: CancellationToken,
    pub terminate_timeout: Duration,
    pub poll_interval: Duration,
    pub trigger: Arc<dyn RunTrigger>,
    pub lookup: Arc<dyn RunLookup>,
}

/// What an implementation produced: a terminal status and a results document
#[derive(Debug)]
pub struct Outcome {
    pub status: RunStatus,
    pub results: serde_json::Value,
}

/// Drives one run from pending to a terminal status
///
/// Never returns an error; every failure mode ends up recorded in the run's
/// status document instead.
pub async fn run(ctx: ExecutionContext) {
    let run_id = ctx.request.run_id;
    let lock = ctx.state.lock(run_id);

    {
        let _guard = lock.lock().await;
        let started = StatusDoc {
            status: RunStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
        };
        if let Err(e) = ctx.state.save_status(run_id, &started).await {
            error!(%run_id, error = %e, "failed to record run start");
            return;
        }
    }
    info!(%run_id, job = %ctx.request.job.name, "run started");

    let result = execute_implementation(&ctx).await;

    let (status, results) = match result {
        Ok(outcome) if outcome.status.is_terminal() => (outcome.status, Some(outcome.results)),
        Ok(outcome) => {
            error!(%run_id, status = ?outcome.status, "implementation returned a non-terminal status");
            (RunStatus::Exception, None)
        }
        Err(WorkerError::Aborted) => {
            info!(%run_id, "run aborted");
            (RunStatus::Aborted, None)
        }
        Err(e) => {
            error!(%run_id, error = %e, "run raised an exception");
            (RunStatus::Exception, None)
        }
    };

    let _guard = lock.lock().await;
    if let Some(results) = results {
        if let Err(e) = ctx.state.save_results(run_id, &results).await {
            warn!(%run_id, error = %e, "failed to persist results");
        }
    }
    let completed = match ctx.state.load_status(run_id).await {
        Ok(mut doc) => {
            doc.status = status;
            doc.completed_at = Some(Utc::now());
            doc
        }
        Err(_) => StatusDoc {
            status,
            started_at: None,
            completed_at: Some(Utc::now()),
        },
    };
    if let Err(e) = ctx.state.save_status(run_id, &completed).await {
        error!(%run_id, error = %e, "failed to record run completion");
    }
    info!(%run_id, status = ?status, "run finished");
}

async fn execute_implementation(ctx: &ExecutionContext) -> Result<Outcome, WorkerError> {
    tokio::fs::create_dir_all(&ctx.workspace).await?;
    match &ctx.request.job.definition {
        JobDefinition::Commands { .. } => JobExecutor.execute(ctx).await,
        JobDefinition::Pipeline { .. } => PipelineExecutor.execute(ctx).await,
    }
}
