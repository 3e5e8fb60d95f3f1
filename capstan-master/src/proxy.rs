//! Master-side worker proxy
//!
//! One proxy per active connection. It owns the in-flight executors for that
//! worker and drives each through a small state machine every tick:
//! pending runs get an `execute`, abort flags become `abort` commands, and
//! terminal runs get their logs verified and a `clean` before the executor is
//! dropped. The executor list is owned exclusively by this proxy; nothing
//! else mutates it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use capstan_core::domain::{Job, Run};
use capstan_core::dto::{ExecuteRequest, ListReply, LogReply, StepCursor, SyncReset, WorkerCommand};
use capstan_messenger::{Messenger, MessengerError};

use crate::error::MasterError;
use crate::store::RunStore;

/// Proxy-local executor status; distinct from the run's own status, which the
/// worker reports asynchronously
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalStatus {
    Pending,
    Running,
    Aborting,
    Verifying,
    Finishing,
    Done,
}

#[derive(Debug)]
pub struct ProxyExecutor {
    pub run_id: Uuid,
    pub job: Job,
    pub parameters: HashMap<String, serde_json::Value>,
    pub local_status: LocalStatus,
    pub should_abort: bool,
}

pub struct WorkerProxy {
    name: String,
    messenger: Messenger,
    run_store: Arc<dyn RunStore>,
    executors: Mutex<Vec<ProxyExecutor>>,
    should_shutdown: AtomicBool,
    ready: AtomicBool,
    tick: Duration,
}

impl WorkerProxy {
    pub fn new(
        name: impl Into<String>,
        messenger: Messenger,
        run_store: Arc<dyn RunStore>,
        tick: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            messenger,
            run_store,
            executors: Mutex::new(Vec::new()),
            should_shutdown: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            tick,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether recovery has completed and the proxy is taking assignments
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.should_shutdown.load(Ordering::SeqCst)
    }

    pub fn flag_shutdown(&self) {
        self.should_shutdown.store(true, Ordering::SeqCst);
    }

    pub async fn executor_count(&self) -> usize {
        self.executors.lock().await.len()
    }

    pub async fn active_runs(&self) -> Vec<Uuid> {
        self.executors.lock().await.iter().map(|e| e.run_id).collect()
    }

    /// Records the assignment and appends a pending executor
    ///
    /// Side effect only; the `execute` command goes out on the next tick.
    pub async fn assign_run(&self, job: Job, run: &Run) -> Result<(), MasterError> {
        let mut executors = self.executors.lock().await;
        if executors.iter().any(|e| e.run_id == run.id) {
            return Err(MasterError::InvalidState(format!(
                "executor for run {} already exists on worker {}",
                run.id, self.name
            )));
        }
        self.run_store.assign_worker(run.id, &self.name).await?;
        executors.push(ProxyExecutor {
            run_id: run.id,
            job,
            parameters: run.parameters.clone(),
            local_status: LocalStatus::Pending,
            should_abort: false,
        });
        debug!(worker = %self.name, run_id = %run.id, "run assigned");
        Ok(())
    }

    /// Flags a run's executor for abort; returns false if unknown here
    pub async fn flag_abort(&self, run_id: Uuid) -> bool {
        let mut executors = self.executors.lock().await;
        match executors.iter_mut().find(|e| e.run_id == run_id) {
            Some(executor) => {
                executor.should_abort = true;
                true
            }
            None => false,
        }
    }

    /// Recovers in-flight runs, then ticks the executor state machine until
    /// the connection dies or a flagged shutdown completes
    pub async fn drive(&self) -> Result<(), MasterError> {
        self.recover().await?;

        loop {
            if self.messenger.is_disposed() {
                return Ok(());
            }

            // Ping; a dead socket surfaces here rather than wedging executors
            if let Err(e) = self
                .messenger
                .send_request(serde_json::to_value(WorkerCommand::Describe)?)
                .await
            {
                info!(worker = %self.name, error = %e, "connection lost");
                return Ok(());
            }

            self.process_executors().await?;

            if self.should_shutdown.load(Ordering::SeqCst)
                && self.executors.lock().await.is_empty()
            {
                info!(worker = %self.name, "shutting worker down");
                let _ = self
                    .messenger
                    .send_update(serde_json::to_value(WorkerCommand::Shutdown)?);
                return Ok(());
            }

            tokio::time::sleep(self.tick).await;
        }
    }

    /// Discovers runs the worker already has in flight and resumes their
    /// executors at running, so a master restart never orphans them
    async fn recover(&self) -> Result<(), MasterError> {
        let reply = self
            .messenger
            .send_request(serde_json::to_value(WorkerCommand::List)?)
            .await?;
        let list: ListReply = serde_json::from_value(reply)
            .map_err(|e| MessengerError::Protocol(format!("bad list reply: {e}")))?;

        for in_flight in list.runs {
            let run_id = in_flight.run_id;
            let reply = match self
                .messenger
                .send_request(serde_json::to_value(WorkerCommand::Request { run_id })?)
                .await
            {
                Ok(reply) => reply,
                Err(MessengerError::Remote(e)) => {
                    warn!(worker = %self.name, run_id = %run_id, error = %e, "recovery lookup failed");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let request: ExecuteRequest = serde_json::from_value(reply)
                .map_err(|e| MessengerError::Protocol(format!("bad request reply: {e}")))?;

            // Rewind the worker's log cursors to what we actually have stored
            let mut steps = Vec::new();
            for step in 0..request.job.step_count() {
                steps.push(StepCursor {
                    index: step,
                    log_cursor: self.run_store.log_cursor(run_id, step).await?,
                });
            }
            let _ = self.messenger.send_update(serde_json::to_value(
                WorkerCommand::Resynchronize {
                    run_id,
                    reset: SyncReset { steps },
                },
            )?);

            info!(worker = %self.name, run_id = %run_id, "recovered in-flight run");
            self.executors.lock().await.push(ProxyExecutor {
                run_id,
                job: request.job,
                parameters: request.parameters,
                local_status: LocalStatus::Running,
                should_abort: false,
            });
        }

        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn process_executors(&self) -> Result<(), MasterError> {
        let mut executors = self.executors.lock().await;
        for executor in executors.iter_mut() {
            self.process_executor(executor).await?;
        }
        // Done is the only state an executor is removed from
        executors.retain(|e| e.local_status != LocalStatus::Done);
        Ok(())
    }

    async fn process_executor(&self, executor: &mut ProxyExecutor) -> Result<(), MasterError> {
        match executor.local_status {
            LocalStatus::Pending => self.start_run(executor).await,
            LocalStatus::Running => {
                if executor.should_abort {
                    self.send_abort(executor).await
                } else {
                    self.check_terminal(executor).await
                }
            }
            LocalStatus::Aborting => self.check_terminal(executor).await,
            LocalStatus::Verifying => self.verify_logs(executor).await,
            LocalStatus::Finishing => self.send_clean(executor).await,
            LocalStatus::Done => Ok(()),
        }
    }

    async fn start_run(&self, executor: &mut ProxyExecutor) -> Result<(), MasterError> {
        let request = WorkerCommand::Execute(ExecuteRequest {
            run_id: executor.run_id,
            job: executor.job.clone(),
            parameters: executor.parameters.clone(),
        });
        match self
            .messenger
            .send_request(serde_json::to_value(request)?)
            .await
        {
            Ok(_) => {
                executor.local_status = LocalStatus::Running;
                Ok(())
            }
            Err(MessengerError::Remote(e)) => {
                warn!(worker = %self.name, run_id = %executor.run_id, error = %e,
                    "worker refused execute");
                self.run_store
                    .update_status(
                        executor.run_id,
                        capstan_core::domain::RunStatus::Exception,
                        None,
                        Some(chrono::Utc::now()),
                    )
                    .await?;
                executor.local_status = LocalStatus::Done;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn send_abort(&self, executor: &mut ProxyExecutor) -> Result<(), MasterError> {
        let command = WorkerCommand::Abort {
            run_id: executor.run_id,
        };
        match self
            .messenger
            .send_request(serde_json::to_value(command)?)
            .await
        {
            Ok(_) | Err(MessengerError::Remote(_)) => {
                // Status comes back through a later status push, not here
                executor.local_status = LocalStatus::Aborting;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn check_terminal(&self, executor: &mut ProxyExecutor) -> Result<(), MasterError> {
        let run = self.run_store.get(executor.run_id).await?;
        if let Some(run) = run {
            if run.status.is_terminal() {
                executor.local_status = LocalStatus::Verifying;
            }
        }
        Ok(())
    }

    /// Fetches any step log the store is missing before the worker forgets it
    async fn verify_logs(&self, executor: &mut ProxyExecutor) -> Result<(), MasterError> {
        for step in 0..executor.job.step_count() {
            if self.run_store.has_log(executor.run_id, step).await? {
                continue;
            }
            let command = WorkerCommand::Log {
                run_id: executor.run_id,
                step,
            };
            match self
                .messenger
                .send_request(serde_json::to_value(command)?)
                .await
            {
                Ok(reply) => {
                    let log: LogReply = serde_json::from_value(reply)
                        .map_err(|e| MessengerError::Protocol(format!("bad log reply: {e}")))?;
                    self.run_store
                        .append_log(executor.run_id, step, 0, log.content.as_bytes())
                        .await?;
                }
                Err(MessengerError::Remote(e)) => {
                    warn!(worker = %self.name, run_id = %executor.run_id, step, error = %e,
                        "log retrieval failed");
                }
                Err(e) => return Err(e.into()),
            }
        }
        executor.local_status = LocalStatus::Finishing;
        Ok(())
    }

    async fn send_clean(&self, executor: &mut ProxyExecutor) -> Result<(), MasterError> {
        let command = WorkerCommand::Clean {
            run_id: executor.run_id,
        };
        match self
            .messenger
            .send_request(serde_json::to_value(command)?)
            .await
        {
            Ok(_) => {
                debug!(worker = %self.name, run_id = %executor.run_id, "run cleaned");
                executor.local_status = LocalStatus::Done;
                Ok(())
            }
            Err(MessengerError::Remote(e)) => {
                // Executor not finished on the worker yet; retried next tick
                warn!(worker = %self.name, run_id = %executor.run_id, error = %e, "clean refused");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
