//! Worker-to-master RPC commands
//!
//! The reverse direction of the duplex channel. Controller workers running
//! pipelines use these to trigger inner runs on the master and to poll them
//! to completion.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum MasterCommand {
    /// Create a pending run for a configured job; replies with `TriggerReply`
    TriggerRun(TriggerRequest),
    /// Fetch a run's current state; replies with the `Run` document
    GetRun { run_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub project: String,
    pub job: String,
    pub parameters: HashMap<String, serde_json::Value>,
    /// What caused the run, e.g. `pipeline:<outer run id>`
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerReply {
    pub run_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_tag_round_trip() {
        let command = MasterCommand::TriggerRun(TriggerRequest {
            project: "web".into(),
            job: "deploy".into(),
            parameters: HashMap::new(),
            source: "pipeline:outer".into(),
        });
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["command"], "trigger_run");
        let back: MasterCommand = serde_json::from_value(json).unwrap();
        assert!(matches!(back, MasterCommand::TriggerRun(_)));
    }
}
