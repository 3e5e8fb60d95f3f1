//! Run domain types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One execution instance of a job
///
/// Structure shared between master (persists, assigns) and worker (executes).
/// The master only ever writes assignment and cancellation fields; the worker
/// side owns status, results, and the timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub project: String,
    pub job: String,
    pub parameters: HashMap<String, serde_json::Value>,
    /// Who or what triggered this run
    pub source: String,
    /// Assigned worker name, if any
    pub worker: Option<String>,
    pub status: RunStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub results: Option<serde_json::Value>,
    #[serde(default)]
    pub should_cancel: bool,
    #[serde(default)]
    pub should_abort: bool,
}

impl Run {
    /// Creates a new pending run for a job
    pub fn new(
        project: impl Into<String>,
        job: impl Into<String>,
        parameters: HashMap<String, serde_json::Value>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project: project.into(),
            job: job.into(),
            parameters,
            source: source.into(),
            worker: None,
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
            results: None,
            should_cancel: false,
            should_abort: false,
        }
    }
}

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
    Cancelled,
    Exception,
}

impl RunStatus {
    /// Whether the status is final; terminal runs are immutable
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_is_pending_and_unassigned() {
        let run = Run::new("web", "deploy", HashMap::new(), "test");
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.worker.is_none());
        assert!(!run.should_cancel);
        assert!(!run.should_abort);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Exception.is_terminal());
    }
}
