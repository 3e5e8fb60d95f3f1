//! On-disk run state
//!
//! Each run owns one directory under the state root:
//!
//! ```text
//! <state_dir>/<run_id>/request.json   original execute request
//! <state_dir>/<run_id>/status.json    status + timestamps
//! <state_dir>/<run_id>/results.json   results document, once set
//! <state_dir>/<run_id>/logs/step-N.log
//! ```
//!
//! The directory is the durable recovery point: a worker restarted mid-run
//! rebuilds its executor list from these directories before reconnecting.
//! Access is serialized per run through an async lock shared by the executor
//! task and the orchestrator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use capstan_core::domain::RunStatus;
use capstan_core::dto::ExecuteRequest;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::WorkerError;

/// Contents of `status.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDoc {
    pub status: RunStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl StatusDoc {
    pub fn pending() -> Self {
        Self {
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
        }
    }
}

pub struct StateDir {
    root: PathBuf,
    locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// The per-run lock; hold it across any multi-file read or write
    pub fn lock(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(locks.entry(run_id).or_default())
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    pub fn log_path(&self, run_id: Uuid, step: usize) -> PathBuf {
        self.run_dir(run_id).join("logs").join(format!("step-{step}.log"))
    }

    pub async fn exists(&self, run_id: Uuid) -> bool {
        tokio::fs::try_exists(self.run_dir(run_id).join("request.json"))
            .await
            .unwrap_or(false)
    }

    pub async fn save_request(&self, request: &ExecuteRequest) -> Result<(), WorkerError> {
        let dir = self.run_dir(request.run_id);
        tokio::fs::create_dir_all(dir.join("logs")).await?;
        write_json(&dir.join("request.json"), request).await
    }

    pub async fn load_request(&self, run_id: Uuid) -> Result<ExecuteRequest, WorkerError> {
        read_json(&self.run_dir(run_id).join("request.json"))
            .await?
            .ok_or_else(|| WorkerError::NotFound(format!("run {run_id}")))
    }

    pub async fn save_status(&self, run_id: Uuid, status: &StatusDoc) -> Result<(), WorkerError> {
        write_json(&self.run_dir(run_id).join("status.json"), status).await
    }

    pub async fn load_status(&self, run_id: Uuid) -> Result<StatusDoc, WorkerError> {
        read_json(&self.run_dir(run_id).join("status.json"))
            .await?
            .ok_or_else(|| WorkerError::NotFound(format!("status for run {run_id}")))
    }

    pub async fn save_results(
        &self,
        run_id: Uuid,
        results: &serde_json::Value,
    ) -> Result<(), WorkerError> {
        write_json(&self.run_dir(run_id).join("results.json"), results).await
    }

    pub async fn load_results(&self, run_id: Uuid) -> Result<Option<serde_json::Value>, WorkerError> {
        read_json(&self.run_dir(run_id).join("results.json")).await
    }

    /// Current byte length of a step's log; zero if the step never ran
    pub async fn log_len(&self, run_id: Uuid, step: usize) -> u64 {
        match tokio::fs::metadata(self.log_path(run_id, step)).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        }
    }

    /// Reads a step's log from `offset` to the end; returns the chunk and how
    /// many bytes it covered
    pub async fn read_log_from(
        &self,
        run_id: Uuid,
        step: usize,
        offset: u64,
    ) -> Result<(String, u64), WorkerError> {
        let path = self.log_path(run_id, step);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((String::new(), 0)),
            Err(e) => return Err(e.into()),
        };
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer).await?;
        let read = buffer.len() as u64;
        Ok((String::from_utf8_lossy(&buffer).into_owned(), read))
    }

    pub async fn read_log(&self, run_id: Uuid, step: usize) -> Result<String, WorkerError> {
        let (content, _) = self.read_log_from(run_id, step, 0).await?;
        Ok(content)
    }

    /// Removes every trace of a run
    pub async fn delete(&self, run_id: Uuid) -> Result<(), WorkerError> {
        let dir = self.run_dir(run_id);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        self.locks.lock().unwrap().remove(&run_id);
        Ok(())
    }

    /// Scans the state root for runs left over from a previous process
    ///
    /// Directories that are not run ids or lack a request document are logged
    /// and skipped, never deleted.
    pub async fn recover(&self) -> Result<Vec<Uuid>, WorkerError> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(run_id) = Uuid::parse_str(name) else {
                warn!(entry = %name, "unrecognized entry in state directory");
                continue;
            };
            if self.exists(run_id).await {
                found.push(run_id);
            } else {
                warn!(%run_id, "state directory without a request document");
            }
        }
        Ok(found)
    }
}

/// Write-then-rename so a crash never leaves a half-written document
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), WorkerError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, WorkerError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::domain::{Job, JobDefinition, JobProperties};

    fn request(run_id: Uuid) -> ExecuteRequest {
        ExecuteRequest {
            run_id,
            job: Job {
                name: "build".into(),
                project: "web".into(),
                definition: JobDefinition::Commands {
                    setup: vec![],
                    commands: vec![vec!["true".into()]],
                    teardown: vec![],
                },
                parameters: HashMap::new(),
                properties: JobProperties::default(),
                enabled: true,
            },
            parameters: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_request_round_trip_and_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());
        let run_id = Uuid::new_v4();

        state.save_request(&request(run_id)).await.unwrap();
        state
            .save_status(run_id, &StatusDoc::pending())
            .await
            .unwrap();

        let loaded = state.load_request(run_id).await.unwrap();
        assert_eq!(loaded.run_id, run_id);
        assert_eq!(state.recover().await.unwrap(), vec![run_id]);

        state.delete(run_id).await.unwrap();
        assert!(!state.exists(run_id).await);
        assert!(state.recover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_reads_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());
        let run_id = Uuid::new_v4();

        state.save_request(&request(run_id)).await.unwrap();
        tokio::fs::write(state.log_path(run_id, 0), b"hello\nworld\n")
            .await
            .unwrap();

        assert_eq!(state.log_len(run_id, 0).await, 12);
        let (chunk, read) = state.read_log_from(run_id, 0, 6).await.unwrap();
        assert_eq!(chunk, "world\n");
        assert_eq!(read, 6);

        // A step that never produced output reads as empty
        let (chunk, read) = state.read_log_from(run_id, 7, 0).await.unwrap();
        assert!(chunk.is_empty());
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_missing_request_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());
        let err = state.load_request(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(_)));
    }
}
