//! Command-sequence execution
//!
//! Steps are numbered across all three phases (setup, then commands, then
//! teardown) so log files line up with the job definition even when a phase
//! is cut short. Setup failure fails the run without touching the main
//! commands; teardown always runs.

use std::collections::HashMap;

use capstan_core::domain::{JobDefinition, RunStatus};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::WorkerError;
use crate::executor::{ExecutionContext, Outcome};
use crate::process_watcher::{ProcessError, ProcessWatcher};

pub struct JobExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Succeeded,
    Failed,
    Skipped,
}

impl StepOutcome {
    fn as_str(self) -> &'static str {
        match self {
            StepOutcome::Succeeded => "succeeded",
            StepOutcome::Failed => "failed",
            StepOutcome::Skipped => "skipped",
        }
    }
}

impl JobExecutor {
    pub async fn execute(&self, ctx: &ExecutionContext) -> Result<Outcome, WorkerError> {
        let JobDefinition::Commands {
            setup,
            commands,
            teardown,
        } = &ctx.request.job.definition
        else {
            return Err(WorkerError::InvalidState(
                "job executor given a pipeline definition".to_string(),
            ));
        };

        let envs = build_environment(ctx);
        let commands_base = setup.len();
        let teardown_base = setup.len() + commands.len();
        let mut outcomes = vec![StepOutcome::Skipped; ctx.request.job.step_count()];

        let mut setup_ok = true;
        for (i, argv) in setup.iter().enumerate() {
            let ok = run_step(ctx, i, argv, &envs).await?;
            outcomes[i] = if ok { StepOutcome::Succeeded } else { StepOutcome::Failed };
            if !ok {
                setup_ok = false;
                break;
            }
        }

        let mut commands_ok = true;
        if setup_ok {
            for (i, argv) in commands.iter().enumerate() {
                let step = commands_base + i;
                let ok = run_step(ctx, step, argv, &envs).await?;
                outcomes[step] = if ok { StepOutcome::Succeeded } else { StepOutcome::Failed };
                if !ok {
                    commands_ok = false;
                    break;
                }
            }
        }

        for (i, argv) in teardown.iter().enumerate() {
            let step = teardown_base + i;
            let ok = run_step(ctx, step, argv, &envs).await?;
            outcomes[step] = if ok { StepOutcome::Succeeded } else { StepOutcome::Failed };
            if !ok {
                warn!(run_id = %ctx.request.run_id, step, "teardown step failed");
            }
        }

        let steps: Vec<serde_json::Value> = outcomes
            .iter()
            .enumerate()
            .map(|(index, outcome)| {
                json!({
                    "index": index,
                    "outcome": outcome.as_str(),
                })
            })
            .collect();

        Ok(Outcome {
            status: if setup_ok && commands_ok {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            },
            results: json!({ "steps": steps }),
        })
    }
}

/// Parameters become `CAPSTAN_PARAM_<NAME>` variables; job defaults first,
/// run parameters override
fn build_environment(ctx: &ExecutionContext) -> HashMap<String, String> {
    let mut envs = HashMap::new();
    envs.insert(
        "CAPSTAN_RUN_ID".to_string(),
        ctx.request.run_id.to_string(),
    );
    let mut parameters = ctx.request.job.parameters.clone();
    parameters.extend(ctx.request.parameters.clone());
    for (name, value) in parameters {
        let rendered = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        envs.insert(format!("CAPSTAN_PARAM_{}", name.to_uppercase()), rendered);
    }
    envs
}

/// Runs one command with its output streamed to `logs/step-N.log`
///
/// Returns whether the command succeeded; only I/O trouble is an error.
async fn run_step(
    ctx: &ExecutionContext,
    step: usize,
    argv: &[String],
    envs: &HashMap<String, String>,
) -> Result<bool, WorkerError> {
    let log_path = ctx.state.log_path(ctx.request.run_id, step);
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }
        let _ = file.flush().await;
    });

    let outcome = run_step_process(ctx, argv, envs, &tx).await;

    // Writer exits once the readers and our local sender are gone
    drop(tx);
    let _ = writer.await;
    outcome
}

async fn run_step_process(
    ctx: &ExecutionContext,
    argv: &[String],
    envs: &HashMap<String, String>,
    tx: &mpsc::UnboundedSender<String>,
) -> Result<bool, WorkerError> {
    let mut watcher = match ProcessWatcher::start(argv, &ctx.workspace, envs, tx.clone()) {
        Ok(watcher) => watcher,
        Err(e @ (ProcessError::Spawn { .. } | ProcessError::EmptyCommand)) => {
            // An unrunnable command fails the step, it does not crash the run
            let _ = tx.send(format!("error: {e}"));
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };

    tokio::select! {
        result = watcher.complete() => match result {
            Ok(()) => Ok(true),
            Err(e @ (ProcessError::NonZeroExit { .. } | ProcessError::Signalled)) => {
                let _ = tx.send(format!("error: {e}"));
                Ok(false)
            }
            Err(e) => Err(e.into()),
        },
        _ = ctx.abort.cancelled() => {
            if let Err(e) = watcher.terminate("run aborted", ctx.terminate_timeout).await {
                warn!(run_id = %ctx.request.run_id, error = %e, "termination failed");
            }
            Err(WorkerError::Aborted)
        }
    }
}
