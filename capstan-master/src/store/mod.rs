//! Store traits
//!
//! Persistence is an external collaborator: the core consumes these narrow
//! async interfaces and never sees a schema. The in-memory implementations
//! back the tests and the default bootstrap.

mod memory;

pub use memory::{MemoryJobStore, MemoryRunStore, MemoryWorkerStore};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use capstan_core::domain::{Job, Run, RunStatus, WorkerRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Run persistence plus the byte-log contract the core needs
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Run>, StoreError>;

    async fn create(&self, run: Run) -> Result<(), StoreError>;

    async fn list_pending(&self) -> Result<Vec<Run>, StoreError>;

    /// Record the worker a run is assigned to
    async fn assign_worker(&self, id: Uuid, worker: &str) -> Result<(), StoreError>;

    /// Transition a run's status, merging timestamps. Terminal runs are
    /// immutable and a run never moves backward in its lifecycle; late or
    /// stale transitions are ignored with a warning.
    async fn update_status(
        &self,
        id: Uuid,
        status: RunStatus,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        completed_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), StoreError>;

    /// Set results; written once by the executor
    async fn set_results(&self, id: Uuid, results: serde_json::Value) -> Result<(), StoreError>;

    async fn set_should_cancel(&self, id: Uuid) -> Result<(), StoreError>;

    /// Append a chunk of one step's log. `offset` is where the sender
    /// believes the file ends; overlap from re-sent chunks is dropped.
    async fn append_log(
        &self,
        id: Uuid,
        step: usize,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StoreError>;

    async fn get_log(&self, id: Uuid, step: usize) -> Result<Option<Vec<u8>>, StoreError>;

    async fn has_log(&self, id: Uuid, step: usize) -> Result<bool, StoreError>;

    /// Stored log length per step, for resynchronizing a reconnected worker
    async fn log_cursor(&self, id: Uuid, step: usize) -> Result<u64, StoreError>;
}

/// Job definitions, read-only from the scheduler's perspective
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, project: &str, name: &str) -> Result<Option<Job>, StoreError>;
}

/// Worker records
#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<WorkerRecord>, StoreError>;

    async fn create(&self, record: WorkerRecord) -> Result<(), StoreError>;

    async fn update(&self, record: &WorkerRecord) -> Result<(), StoreError>;
}
