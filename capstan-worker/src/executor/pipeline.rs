//! Pipeline execution
//!
//! A pipeline run does not spawn subprocesses itself; it triggers the runs of
//! other jobs through the master and polls them to completion, releasing each
//! DAG element once its predecessor gates are satisfied. Inner-run state is
//! persisted as the run's results document every pass, so a recovered worker
//! can still show what the pipeline reached.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use capstan_core::domain::{JobDefinition, PipelineElement, Run, RunStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::executor::{ExecutionContext, Outcome};

/// Creates runs on behalf of a pipeline
#[async_trait]
pub trait RunTrigger: Send + Sync {
    async fn trigger_job(
        &self,
        project: &str,
        job: &str,
        parameters: HashMap<String, serde_json::Value>,
        source: &str,
    ) -> Result<Uuid, WorkerError>;
}

/// Polls runs a pipeline has triggered
#[async_trait]
pub trait RunLookup: Send + Sync {
    async fn get_run(&self, run_id: Uuid) -> Result<Run, WorkerError>;
}

/// One DAG element's progress; `run_id` is set once triggered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerRun {
    pub element: String,
    pub project: String,
    pub job: String,
    pub run_id: Option<Uuid>,
    pub status: RunStatus,
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    pub async fn execute(&self, ctx: &ExecutionContext) -> Result<Outcome, WorkerError> {
        let JobDefinition::Pipeline { elements } = &ctx.request.job.definition else {
            return Err(WorkerError::InvalidState(
                "pipeline executor given a commands definition".to_string(),
            ));
        };
        validate(elements)?;

        let mut inner: Vec<InnerRun> = elements
            .iter()
            .map(|element| InnerRun {
                element: element.name.clone(),
                project: element.project.clone(),
                job: element.job.clone(),
                run_id: None,
                status: RunStatus::Pending,
            })
            .collect();
        let source = format!("pipeline:{}", ctx.request.run_id);

        loop {
            if ctx.abort.is_cancelled() {
                self.persist(ctx, &inner).await;
                return Err(WorkerError::Aborted);
            }

            let progressed = self.advance(ctx, elements, &mut inner, &source).await;
            self.poll(ctx, &mut inner).await;
            self.persist(ctx, &inner).await;

            if inner.iter().all(|run| run.status.is_terminal()) {
                break;
            }

            let stalled = !progressed
                && inner
                    .iter()
                    .all(|run| run.run_id.is_none() || run.status.is_terminal());
            if stalled {
                return Err(WorkerError::InvalidState(
                    "pipeline stalled with untriggerable elements".to_string(),
                ));
            }

            tokio::select! {
                _ = tokio::time::sleep(ctx.poll_interval) => {}
                _ = ctx.abort.cancelled() => {}
            }
        }

        Ok(Outcome {
            status: aggregate(&inner),
            results: json!({ "elements": inner }),
        })
    }

    /// Triggers every eligible element and cancels elements whose gates can
    /// no longer be satisfied; true if anything is still moving
    async fn advance(
        &self,
        ctx: &ExecutionContext,
        elements: &[PipelineElement],
        inner: &mut [InnerRun],
        source: &str,
    ) -> bool {
        let mut progressed = false;
        for index in 0..elements.len() {
            if inner[index].run_id.is_some() || inner[index].status.is_terminal() {
                continue;
            }
            match gate_state(&elements[index], inner) {
                GateState::Open => {
                    let element = &elements[index];
                    let mut parameters = ctx.request.parameters.clone();
                    parameters.extend(element.parameters.clone());
                    match ctx
                        .trigger
                        .trigger_job(&element.project, &element.job, parameters, source)
                        .await
                    {
                        Ok(run_id) => {
                            debug!(pipeline = %ctx.request.run_id, element = %element.name,
                                %run_id, "pipeline element triggered");
                            inner[index].run_id = Some(run_id);
                            progressed = true;
                        }
                        Err(e) => {
                            // Retried next pass; the master may be unreachable
                            warn!(pipeline = %ctx.request.run_id, element = %element.name,
                                error = %e, "trigger failed");
                            progressed = true;
                        }
                    }
                }
                GateState::Unsatisfiable => {
                    debug!(pipeline = %ctx.request.run_id, element = %inner[index].element,
                        "pipeline element skipped, gate unsatisfiable");
                    inner[index].status = RunStatus::Cancelled;
                    progressed = true;
                }
                GateState::Waiting => {}
            }
        }
        progressed
    }

    async fn poll(&self, ctx: &ExecutionContext, inner: &mut [InnerRun]) {
        for run in inner.iter_mut() {
            let Some(run_id) = run.run_id else { continue };
            if run.status.is_terminal() {
                continue;
            }
            match ctx.lookup.get_run(run_id).await {
                Ok(current) => run.status = current.status,
                Err(e) => {
                    warn!(pipeline = %ctx.request.run_id, %run_id, error = %e, "run poll failed");
                }
            }
        }
    }

    async fn persist(&self, ctx: &ExecutionContext, inner: &[InnerRun]) {
        let doc = json!({ "elements": inner });
        if let Err(e) = ctx.state.save_results(ctx.request.run_id, &doc).await {
            warn!(run_id = %ctx.request.run_id, error = %e, "failed to persist pipeline state");
        }
    }
}

enum GateState {
    Open,
    Waiting,
    Unsatisfiable,
}

fn gate_state(element: &PipelineElement, inner: &[InnerRun]) -> GateState {
    let mut state = GateState::Open;
    for gate in &element.after {
        let Some(predecessor) = inner.iter().find(|run| run.element == gate.element) else {
            return GateState::Unsatisfiable;
        };
        if predecessor.status.is_terminal() {
            if gate.accepts(predecessor.status) {
                continue;
            }
            return GateState::Unsatisfiable;
        }
        state = GateState::Waiting;
    }
    state
}

fn aggregate(inner: &[InnerRun]) -> RunStatus {
    if inner
        .iter()
        .any(|run| matches!(run.status, RunStatus::Failed | RunStatus::Exception))
    {
        RunStatus::Failed
    } else if inner
        .iter()
        .any(|run| matches!(run.status, RunStatus::Aborted | RunStatus::Cancelled))
    {
        RunStatus::Aborted
    } else {
        RunStatus::Succeeded
    }
}

fn validate(elements: &[PipelineElement]) -> Result<(), WorkerError> {
    let mut names = HashSet::new();
    for element in elements {
        if !names.insert(element.name.as_str()) {
            return Err(WorkerError::InvalidState(format!(
                "duplicate pipeline element {}",
                element.name
            )));
        }
    }
    for element in elements {
        for gate in &element.after {
            if !names.contains(gate.element.as_str()) {
                return Err(WorkerError::InvalidState(format!(
                    "element {} gates on unknown element {}",
                    element.name, gate.element
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateDir;
    use capstan_core::domain::{ElementGate, Job, JobProperties};
    use capstan_core::dto::ExecuteRequest;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Fake master: triggered runs complete instantly with a per-job status
    struct FakeRuns {
        outcomes: HashMap<String, RunStatus>,
        runs: StdMutex<HashMap<Uuid, Run>>,
        trigger_order: StdMutex<Vec<String>>,
    }

    impl FakeRuns {
        fn new(outcomes: &[(&str, RunStatus)]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: outcomes
                    .iter()
                    .map(|(job, status)| (job.to_string(), *status))
                    .collect(),
                runs: StdMutex::new(HashMap::new()),
                trigger_order: StdMutex::new(Vec::new()),
            })
        }

        fn order(&self) -> Vec<String> {
            self.trigger_order.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RunTrigger for FakeRuns {
        async fn trigger_job(
            &self,
            project: &str,
            job: &str,
            parameters: HashMap<String, serde_json::Value>,
            source: &str,
        ) -> Result<Uuid, WorkerError> {
            let mut run = Run::new(project, job, parameters, source);
            run.status = self
                .outcomes
                .get(job)
                .copied()
                .unwrap_or(RunStatus::Succeeded);
            let run_id = run.id;
            self.runs.lock().unwrap().insert(run_id, run);
            self.trigger_order.lock().unwrap().push(job.to_string());
            Ok(run_id)
        }
    }

    #[async_trait]
    impl RunLookup for FakeRuns {
        async fn get_run(&self, run_id: Uuid) -> Result<Run, WorkerError> {
            self.runs
                .lock()
                .unwrap()
                .get(&run_id)
                .cloned()
                .ok_or_else(|| WorkerError::NotFound(run_id.to_string()))
        }
    }

    fn element(name: &str, after: Vec<ElementGate>) -> PipelineElement {
        PipelineElement {
            name: name.into(),
            project: "web".into(),
            job: name.into(),
            parameters: HashMap::new(),
            after,
        }
    }

    async fn context(
        dir: &tempfile::TempDir,
        elements: Vec<PipelineElement>,
        fake: Arc<FakeRuns>,
    ) -> ExecutionContext {
        let run_id = Uuid::new_v4();
        let request = ExecuteRequest {
            run_id,
            job: Job {
                name: "pipeline".into(),
                project: "web".into(),
                definition: JobDefinition::Pipeline { elements },
                parameters: HashMap::new(),
                properties: JobProperties {
                    is_controller: true,
                },
                enabled: true,
            },
            parameters: HashMap::new(),
        };
        let state = Arc::new(StateDir::new(dir.path().join("state")));
        state.save_request(&request).await.unwrap();
        ExecutionContext {
            request,
            state,
            workspace: dir.path().join("workspace"),
            abort: CancellationToken::new(),
            terminate_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            trigger: Arc::clone(&fake) as Arc<dyn RunTrigger>,
            lookup: fake as Arc<dyn RunLookup>,
        }
    }

    #[tokio::test]
    async fn test_independent_elements_all_run() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeRuns::new(&[]);
        let ctx = context(
            &dir,
            vec![
                element("a", vec![]),
                element("b", vec![]),
                element("c", vec![]),
            ],
            Arc::clone(&fake),
        )
        .await;

        let outcome = PipelineExecutor.execute(&ctx).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(fake.order().len(), 3);
    }

    #[tokio::test]
    async fn test_linear_chain_triggers_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeRuns::new(&[]);
        let ctx = context(
            &dir,
            vec![
                element("a", vec![]),
                element("b", vec![ElementGate::on_success("a")]),
                element("c", vec![ElementGate::on_success("b")]),
            ],
            Arc::clone(&fake),
        )
        .await;

        let outcome = PipelineExecutor.execute(&ctx).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(fake.order(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_diamond_failure_skips_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeRuns::new(&[("b", RunStatus::Failed)]);
        let ctx = context(
            &dir,
            vec![
                element("a", vec![]),
                element("b", vec![ElementGate::on_success("a")]),
                element("c", vec![ElementGate::on_success("a")]),
                element(
                    "d",
                    vec![ElementGate::on_success("b"), ElementGate::on_success("c")],
                ),
            ],
            Arc::clone(&fake),
        )
        .await;

        let outcome = PipelineExecutor.execute(&ctx).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        // d never triggered: its gate on b is unsatisfiable
        assert!(!fake.order().contains(&"d".to_string()));

        let elements: Vec<InnerRun> =
            serde_json::from_value(outcome.results["elements"].clone()).unwrap();
        let d = elements.iter().find(|run| run.element == "d").unwrap();
        assert_eq!(d.status, RunStatus::Cancelled);
        assert!(d.run_id.is_none());
    }

    #[tokio::test]
    async fn test_gate_accepting_failure_still_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeRuns::new(&[("a", RunStatus::Failed)]);
        let ctx = context(
            &dir,
            vec![
                element("a", vec![]),
                element(
                    "notify",
                    vec![ElementGate {
                        element: "a".into(),
                        accepted: vec![RunStatus::Succeeded, RunStatus::Failed],
                    }],
                ),
            ],
            Arc::clone(&fake),
        )
        .await;

        let outcome = PipelineExecutor.execute(&ctx).await.unwrap();
        // a failed, so the pipeline failed, but notify still ran
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(fake.order().contains(&"notify".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_gate_element_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeRuns::new(&[]);
        let ctx = context(
            &dir,
            vec![element("a", vec![ElementGate::on_success("ghost")])],
            fake,
        )
        .await;

        let err = PipelineExecutor.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, WorkerError::InvalidState(_)));
    }
}
