//! Worker-to-master synchronization payloads
//!
//! Pushed as messenger updates by the worker's per-run Synchronization
//! helper. Uncorrelated and best-effort; the worker re-sends anything the
//! master missed after a `resynchronize`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::RunStatus;

/// One push from worker to master about a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "update", rename_all = "snake_case")]
pub enum RunUpdate {
    Status(StatusUpdate),
    Results(ResultsUpdate),
    Log(LogDelta),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsUpdate {
    pub run_id: Uuid,
    pub results: serde_json::Value,
}

/// A chunk of one step's log, starting at `offset` bytes into the file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDelta {
    pub run_id: Uuid,
    pub step: usize,
    pub offset: u64,
    pub data: String,
}

/// Master-provided cursors for rebuilding a run's log synchronization state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReset {
    pub steps: Vec<StepCursor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCursor {
    pub index: usize,
    pub log_cursor: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_update_tag() {
        let update = RunUpdate::Status(StatusUpdate {
            run_id: Uuid::new_v4(),
            status: RunStatus::Running,
            started_at: Some(chrono::Utc::now()),
            completed_at: None,
        });
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["update"], "status");
        assert_eq!(json["status"], "running");
    }
}
