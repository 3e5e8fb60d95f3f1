//! Worker record domain types

use serde::{Deserialize, Serialize};

/// Persisted record of a worker known to the master
///
/// Mutated by the Supervisor on connect/disconnect and by administrative
/// action (enable/disable, disconnect flag).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub name: String,
    /// User the worker registered under; re-registration by a different
    /// owner is refused
    pub owner: String,
    pub version: String,
    pub display_name: String,
    pub properties: WorkerProperties,
    pub is_enabled: bool,
    pub is_active: bool,
    /// Administrative request for a graceful disconnect
    pub should_disconnect: bool,
}

impl WorkerRecord {
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            owner: owner.into(),
            version: version.into(),
            properties: WorkerProperties::default(),
            is_enabled: true,
            is_active: false,
            should_disconnect: false,
        }
    }
}

/// Capability tags consulted by worker selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProperties {
    /// Projects this worker accepts runs for
    pub projects: Vec<String>,
    /// Controller workers run pipeline/controller jobs
    pub is_controller: bool,
    /// Maximum concurrent executors
    pub executor_limit: usize,
}

impl Default for WorkerProperties {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            is_controller: false,
            executor_limit: 2,
        }
    }
}

impl WorkerProperties {
    /// Whether this worker can take runs for a job with the given project
    /// and controller flag
    pub fn accepts(&self, project: &str, is_controller: bool) -> bool {
        self.is_controller == is_controller
            && self.projects.iter().any(|p| p == project)
    }
}
