//! Master-to-worker RPC commands
//!
//! A closed enum, matched exhaustively on the worker side so there is no
//! "unknown command" error class at runtime. All commands are
//! request/response except `Resynchronize` and `Shutdown`, which arrive as
//! uncorrelated updates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::{Job, WorkerProperties};
use crate::dto::sync::SyncReset;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Capability/identity probe; also serves as the proxy's connection ping
    Describe,
    /// Run identifiers the worker currently has in flight
    List,
    /// Start a new run
    Execute(ExecuteRequest),
    /// Drop a finished run's state; an error if the run is still executing
    Clean { run_id: Uuid },
    /// Signal a running run's subprocess
    Abort { run_id: Uuid },
    /// Return the original execute request, for recovery after reconnect
    Request { run_id: Uuid },
    /// Fetch one step's log content
    Log { run_id: Uuid, step: usize },
    /// Rewind the worker's log cursors after a master restart (update)
    Resynchronize { run_id: Uuid, reset: SyncReset },
    /// Ask the worker to stop its connection loop (update)
    Shutdown,
}

/// Payload of `WorkerCommand::Execute`; also the document persisted on the
/// worker side and returned by `Request`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub run_id: Uuid,
    pub job: Job,
    pub parameters: HashMap<String, serde_json::Value>,
}

/// Reply to `Describe`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescribeReply {
    pub display_name: String,
    pub properties: WorkerProperties,
}

/// Reply to `List`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListReply {
    pub runs: Vec<RunInFlight>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInFlight {
    pub run_id: Uuid,
}

/// Reply to `Log`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogReply {
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobDefinition, JobProperties};

    #[test]
    fn test_command_tag_round_trip() {
        let command = WorkerCommand::Clean {
            run_id: Uuid::new_v4(),
        };
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["command"], "clean");
        let back: WorkerCommand = serde_json::from_value(json).unwrap();
        assert!(matches!(back, WorkerCommand::Clean { .. }));
    }

    #[test]
    fn test_execute_request_carries_job() {
        let request = ExecuteRequest {
            run_id: Uuid::new_v4(),
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
        };
        let json = serde_json::to_value(&WorkerCommand::Execute(request)).unwrap();
        assert_eq!(json["command"], "execute");
        assert_eq!(json["job"]["name"], "build");
    }
}
