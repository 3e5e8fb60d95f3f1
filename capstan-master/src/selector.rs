//! Worker selection policy
//!
//! Enumerates available workers, shuffles to avoid head-of-line bias, and
//! returns the first one whose capability tags fit the job and whose live
//! executor count is under its configured limit.

use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::debug;

use capstan_core::domain::Job;

use crate::error::MasterError;
use crate::store::WorkerStore;
use crate::supervisor::Supervisor;

pub struct WorkerSelector {
    supervisor: Arc<Supervisor>,
    worker_store: Arc<dyn WorkerStore>,
}

impl WorkerSelector {
    pub fn new(supervisor: Arc<Supervisor>, worker_store: Arc<dyn WorkerStore>) -> Self {
        Self {
            supervisor,
            worker_store,
        }
    }

    /// Picks a worker for the job, or `None` so the run stays pending for
    /// the next scheduler tick
    pub async fn select(&self, job: &Job) -> Result<Option<String>, MasterError> {
        let mut names = self.supervisor.available_workers().await;
        names.shuffle(&mut rand::rng());

        for name in names {
            let record = match self.worker_store.get(&name).await? {
                Some(record) => record,
                None => continue,
            };
            if !record
                .properties
                .accepts(&job.project, job.properties.is_controller)
            {
                continue;
            }
            let live = self.supervisor.executor_count(&name).await;
            if live >= record.properties.executor_limit {
                debug!(worker = %name, live, "worker at executor limit");
                continue;
            }
            return Ok(Some(name));
        }
        Ok(None)
    }
}
