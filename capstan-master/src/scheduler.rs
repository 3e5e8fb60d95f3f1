//! Job scheduler
//!
//! Periodically scans pending runs and places each on an available worker.
//! One run's failure never halts the scan: the run is marked exception and
//! the loop moves on.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use capstan_core::domain::RunStatus;

use crate::error::MasterError;
use crate::selector::WorkerSelector;
use crate::store::{JobStore, RunStore};
use crate::supervisor::Supervisor;

pub struct JobScheduler {
    run_store: Arc<dyn RunStore>,
    job_store: Arc<dyn JobStore>,
    supervisor: Arc<Supervisor>,
    selector: WorkerSelector,
    interval: std::time::Duration,
}

impl JobScheduler {
    pub fn new(
        run_store: Arc<dyn RunStore>,
        job_store: Arc<dyn JobStore>,
        supervisor: Arc<Supervisor>,
        selector: WorkerSelector,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            run_store,
            job_store,
            supervisor,
            selector,
            interval,
        }
    }

    /// Scan loop; runs until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        error!(error = %e, "scheduler scan failed");
                    }
                }
            }
        }
    }

    /// One scan over all pending runs
    pub async fn scan(&self) -> Result<(), MasterError> {
        let pending = self.run_store.list_pending().await?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!(count = pending.len(), "scanning pending runs");

        for run in pending {
            let run_id = run.id;
            if let Err(e) = self.schedule_one(run).await {
                // Isolation: a bad run never halts the scan
                error!(run_id = %run_id, error = %e, "scheduling failed, marking exception");
                let _ = self
                    .run_store
                    .update_status(run_id, RunStatus::Exception, None, Some(chrono::Utc::now()))
                    .await;
            }
        }
        Ok(())
    }

    async fn schedule_one(&self, run: capstan_core::domain::Run) -> Result<(), MasterError> {
        if run.should_cancel {
            info!(run_id = %run.id, "cancelling flagged run");
            self.run_store
                .update_status(run.id, RunStatus::Cancelled, None, Some(chrono::Utc::now()))
                .await?;
            return Ok(());
        }

        let job = self
            .job_store
            .get(&run.project, &run.job)
            .await?
            .ok_or_else(|| {
                MasterError::NotFound(format!("job {}/{}", run.project, run.job))
            })?;
        if !job.enabled {
            debug!(run_id = %run.id, job = %job.name, "job disabled, leaving pending");
            return Ok(());
        }

        let worker = match self.selector.select(&job).await? {
            Some(worker) => worker,
            // No capacity anywhere; stays pending for the next tick
            None => return Ok(()),
        };

        self.supervisor.assign_run(&worker, job, &run).await?;
        self.run_store
            .update_status(run.id, RunStatus::Running, None, None)
            .await?;
        info!(run_id = %run.id, worker = %worker, "run scheduled");
        Ok(())
    }

    /// Cancels a run; succeeds only while it is still pending
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<bool, MasterError> {
        let run = self
            .run_store
            .get(run_id)
            .await?
            .ok_or_else(|| MasterError::NotFound(format!("run {run_id}")))?;
        if run.status != RunStatus::Pending {
            return Ok(false);
        }
        // The flag lands first: a scan racing this call sees it and cancels
        // instead of assigning the run
        self.run_store.set_should_cancel(run_id).await?;
        self.run_store
            .update_status(run_id, RunStatus::Cancelled, None, Some(chrono::Utc::now()))
            .await?;
        Ok(true)
    }

    /// Flags a running run for abort; succeeds only if its worker is
    /// currently connected
    pub async fn abort_run(&self, run_id: Uuid) -> Result<bool, MasterError> {
        let run = self
            .run_store
            .get(run_id)
            .await?
            .ok_or_else(|| MasterError::NotFound(format!("run {run_id}")))?;
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        let worker = match run.worker {
            Some(worker) => worker,
            None => return Ok(false),
        };
        Ok(self.supervisor.flag_abort(&worker, run_id).await)
    }
}
