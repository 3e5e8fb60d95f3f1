//! Job domain types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::pipeline::PipelineElement;

/// A reusable job definition that runs are created from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub project: String,
    pub definition: JobDefinition,
    /// Default parameters, overridable per run
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub properties: JobProperties,
    pub enabled: bool,
}

/// What a job actually does: a command sequence or a pipeline of other jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobDefinition {
    Commands {
        /// Preparation commands; any failure fails the run outright
        #[serde(default)]
        setup: Vec<Vec<String>>,
        /// Main commands, run in order, stopping at the first failure
        commands: Vec<Vec<String>>,
        /// Always run, even after a failure
        #[serde(default)]
        teardown: Vec<Vec<String>>,
    },
    Pipeline { elements: Vec<PipelineElement> },
}

/// Capability tags consulted by worker selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProperties {
    /// Controller jobs (pipelines and other runs-triggering jobs) only run
    /// on controller workers
    #[serde(default)]
    pub is_controller: bool,
}

impl Default for JobProperties {
    fn default() -> Self {
        Self {
            is_controller: false,
        }
    }
}

impl Job {
    /// Number of command steps a run of this job produces
    pub fn step_count(&self) -> usize {
        match &self.definition {
            JobDefinition::Commands {
                setup,
                commands,
                teardown,
            } => setup.len() + commands.len() + teardown.len(),
            JobDefinition::Pipeline { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_count_for_commands() {
        let job = Job {
            name: "build".into(),
            project: "web".into(),
            definition: JobDefinition::Commands {
                setup: vec![vec!["git".into(), "fetch".into()]],
                commands: vec![
                    vec!["make".into()],
                    vec!["make".into(), "test".into()],
                ],
                teardown: vec![vec!["make".into(), "clean".into()]],
            },
            parameters: HashMap::new(),
            properties: JobProperties::default(),
            enabled: true,
        };
        assert_eq!(job.step_count(), 4);
    }

    #[test]
    fn test_definition_round_trips_through_json() {
        let definition = JobDefinition::Commands {
            setup: vec![],
            commands: vec![vec!["true".into()]],
            teardown: vec![],
        };
        let json = serde_json::to_value(&definition).unwrap();
        let back: JobDefinition = serde_json::from_value(json).unwrap();
        match back {
            JobDefinition::Commands { commands, .. } => assert_eq!(commands.len(), 1),
            _ => panic!("expected commands definition"),
        }
    }
}
