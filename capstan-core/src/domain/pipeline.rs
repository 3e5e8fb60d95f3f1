//! Pipeline domain types
//!
//! A pipeline job is a DAG of references to other jobs ("elements"), each
//! gated on the statuses its predecessors must reach before it is triggered.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::run::RunStatus;

/// One node of a pipeline DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineElement {
    /// Unique name within the pipeline
    pub name: String,
    pub project: String,
    pub job: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Predecessor gates; empty means the element is immediately eligible
    #[serde(default)]
    pub after: Vec<ElementGate>,
}

/// A predecessor gate: the named element must reach one of the accepted
/// statuses before the gated element may be triggered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementGate {
    pub element: String,
    pub accepted: Vec<RunStatus>,
}

impl ElementGate {
    /// Gate on successful completion of a predecessor
    pub fn on_success(element: impl Into<String>) -> Self {
        Self {
            element: element.into(),
            accepted: vec![RunStatus::Succeeded],
        }
    }

    /// Whether a predecessor status satisfies this gate
    pub fn accepts(&self, status: RunStatus) -> bool {
        self.accepted.contains(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_success_gate() {
        let gate = ElementGate::on_success("build");
        assert!(gate.accepts(RunStatus::Succeeded));
        assert!(!gate.accepts(RunStatus::Failed));
        assert!(!gate.accepts(RunStatus::Running));
    }
}
