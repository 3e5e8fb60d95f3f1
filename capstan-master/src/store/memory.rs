//! In-memory store implementations

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use capstan_core::domain::{Job, Run, RunStatus, WorkerRecord};

use super::{JobStore, RunStore, StoreError, WorkerStore};

/// Lifecycle order; updates may only move a run forward
fn status_rank(status: RunStatus) -> u8 {
    match status {
        RunStatus::Pending => 0,
        RunStatus::Running => 1,
        _ => 2,
    }
}

#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<Uuid, Run>>,
    logs: Mutex<HashMap<(Uuid, usize), Vec<u8>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn get(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self.runs.lock().unwrap().get(&id).cloned())
    }

    async fn create(&self, run: Run) -> Result<(), StoreError> {
        self.runs.lock().unwrap().insert(run.id, run);
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<Run>, StoreError> {
        Ok(self
            .runs
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == RunStatus::Pending)
            .cloned()
            .collect())
    }

    async fn assign_worker(&self, id: Uuid, worker: &str) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        run.worker = Some(worker.to_string());
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: RunStatus,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        completed_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        if run.status.is_terminal() {
            warn!(run_id = %id, ?status, "ignoring status update for terminal run");
            return Ok(());
        }
        // A worker's delayed pending push must not undo the scheduler's
        // running transition
        if status_rank(status) < status_rank(run.status) {
            warn!(run_id = %id, from = ?run.status, to = ?status,
                "ignoring backward status update");
            return Ok(());
        }
        run.status = status;
        if run.started_at.is_none() {
            run.started_at = started_at;
        }
        if run.completed_at.is_none() {
            run.completed_at = completed_at;
        }
        Ok(())
    }

    async fn set_results(&self, id: Uuid, results: serde_json::Value) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        run.results = Some(results);
        Ok(())
    }

    async fn set_should_cancel(&self, id: Uuid) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        run.should_cancel = true;
        Ok(())
    }

    async fn append_log(
        &self,
        id: Uuid,
        step: usize,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let mut logs = self.logs.lock().unwrap();
        let buffer = logs.entry((id, step)).or_default();
        let stored = buffer.len() as u64;
        if offset > stored {
            warn!(run_id = %id, step, offset, stored, "log gap, appending anyway");
            buffer.extend_from_slice(data);
        } else {
            let overlap = (stored - offset) as usize;
            if overlap < data.len() {
                buffer.extend_from_slice(&data[overlap..]);
            }
        }
        Ok(())
    }

    async fn get_log(&self, id: Uuid, step: usize) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.logs.lock().unwrap().get(&(id, step)).cloned())
    }

    async fn has_log(&self, id: Uuid, step: usize) -> Result<bool, StoreError> {
        Ok(self.logs.lock().unwrap().contains_key(&(id, step)))
    }

    async fn log_cursor(&self, id: Uuid, step: usize) -> Result<u64, StoreError> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .get(&(id, step))
            .map(|b| b.len() as u64)
            .unwrap_or(0))
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<(String, String), Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) {
        self.jobs
            .lock()
            .unwrap()
            .insert((job.project.clone(), job.name.clone()), job);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, project: &str, name: &str) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(&(project.to_string(), name.to_string()))
            .cloned())
    }
}

#[derive(Default)]
pub struct MemoryWorkerStore {
    workers: Mutex<HashMap<String, WorkerRecord>>,
}

impl MemoryWorkerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerStore for MemoryWorkerStore {
    async fn get(&self, name: &str) -> Result<Option<WorkerRecord>, StoreError> {
        Ok(self.workers.lock().unwrap().get(name).cloned())
    }

    async fn create(&self, record: WorkerRecord) -> Result<(), StoreError> {
        self.workers
            .lock()
            .unwrap()
            .insert(record.name.clone(), record);
        Ok(())
    }

    async fn update(&self, record: &WorkerRecord) -> Result<(), StoreError> {
        self.workers
            .lock()
            .unwrap()
            .insert(record.name.clone(), record.clone());
        Ok(())
    }
}
