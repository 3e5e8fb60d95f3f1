//! Worker orchestrator
//!
//! Owns the watcher for every run this worker knows about and dispatches the
//! master's commands to them. Installed as the messenger's `MessageHandler`,
//! so each incoming command runs on its own task; everything here must hold
//! the watcher map only briefly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capstan_core::domain::RunStatus;
use capstan_core::dto::{
    DescribeReply, ExecuteRequest, ListReply, LogReply, RunInFlight, WorkerCommand,
};
use capstan_messenger::{MessageHandler, Messenger};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::executor::{ExecutionContext, RunLookup, RunTrigger};
use crate::link::LinkHandle;
use crate::state::{StateDir, StatusDoc};
use crate::sync::Synchronization;
use crate::watcher::ExecutorWatcher;

pub struct Worker {
    config: WorkerConfig,
    state: Arc<StateDir>,
    watchers: Mutex<HashMap<Uuid, Arc<ExecutorWatcher>>>,
    trigger: Arc<dyn RunTrigger>,
    lookup: Arc<dyn RunLookup>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        state: Arc<StateDir>,
        trigger: Arc<dyn RunTrigger>,
        lookup: Arc<dyn RunLookup>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            state,
            watchers: Mutex::new(HashMap::new()),
            trigger,
            lookup,
            shutdown: CancellationToken::new(),
        })
    }

    /// Cancelled when the master asks this worker to stop reconnecting
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Rebuilds watchers from on-disk state left by a previous process
    ///
    /// Runs that were still executing when the process died cannot be resumed
    /// (their subprocesses are gone), so they are recorded as exceptions; the
    /// master verifies their logs and cleans them like any other finished run.
    /// Must complete before the first connection is opened, otherwise `list`
    /// would under-report.
    pub async fn recover(&self) -> Result<usize, WorkerError> {
        let run_ids = self.state.recover().await?;
        let mut watchers = self.watchers.lock().await;
        for run_id in run_ids {
            let lock = self.state.lock(run_id);
            let _guard = lock.lock().await;

            let request = self.state.load_request(run_id).await?;
            let mut status = match self.state.load_status(run_id).await {
                Ok(status) => status,
                Err(WorkerError::NotFound(_)) => StatusDoc::pending(),
                Err(e) => return Err(e),
            };
            if !status.status.is_terminal() {
                warn!(%run_id, "run interrupted by worker restart");
                status.status = RunStatus::Exception;
                status.completed_at = Some(Utc::now());
                self.state.save_status(run_id, &status).await?;
            }

            let sync = Arc::new(Synchronization::new(
                run_id,
                Arc::clone(&self.state),
                request.job.step_count(),
            ));
            watchers.insert(run_id, ExecutorWatcher::observe(run_id, sync));
            info!(%run_id, status = ?status.status, "recovered run from disk");
        }
        Ok(watchers.len())
    }

    /// Persists the request and starts executing it
    pub async fn execute(&self, request: ExecuteRequest) -> Result<(), WorkerError> {
        let run_id = request.run_id;
        let mut watchers = self.watchers.lock().await;
        if watchers.contains_key(&run_id) || self.state.exists(run_id).await {
            return Err(WorkerError::InvalidState(format!(
                "run {run_id} already exists on this worker"
            )));
        }

        self.state.save_request(&request).await?;
        self.state.save_status(run_id, &StatusDoc::pending()).await?;

        let sync = Arc::new(Synchronization::new(
            run_id,
            Arc::clone(&self.state),
            request.job.step_count(),
        ));
        let ctx = ExecutionContext {
            workspace: self.config.workspace_dir.join(run_id.to_string()),
            request,
            state: Arc::clone(&self.state),
            abort: CancellationToken::new(),
            terminate_timeout: self.config.terminate_timeout,
            poll_interval: self.config.pipeline_poll_interval,
            trigger: Arc::clone(&self.trigger),
            lookup: Arc::clone(&self.lookup),
        };
        watchers.insert(run_id, ExecutorWatcher::spawn(ctx, sync));
        info!(%run_id, "run accepted");
        Ok(())
    }

    /// Drops a finished run's state; refused while it is still executing
    pub async fn clean(&self, run_id: Uuid) -> Result<(), WorkerError> {
        let mut watchers = self.watchers.lock().await;
        match watchers.get(&run_id) {
            Some(watcher) if !watcher.is_finished() => Err(WorkerError::InvalidState(format!(
                "run {run_id} is still executing"
            ))),
            Some(watcher) => {
                watcher.sync().dispose();
                watchers.remove(&run_id);
                self.state.delete(run_id).await?;
                let workspace = self.config.workspace_dir.join(run_id.to_string());
                if tokio::fs::try_exists(&workspace).await.unwrap_or(false) {
                    let _ = tokio::fs::remove_dir_all(&workspace).await;
                }
                info!(%run_id, "run cleaned");
                Ok(())
            }
            None => Err(WorkerError::NotFound(format!("run {run_id}"))),
        }
    }

    pub async fn abort(&self, run_id: Uuid) -> Result<(), WorkerError> {
        match self.watchers.lock().await.get(&run_id) {
            Some(watcher) => {
                watcher.abort();
                Ok(())
            }
            None => Err(WorkerError::NotFound(format!("run {run_id}"))),
        }
    }

    pub async fn active_runs(&self) -> Vec<Uuid> {
        self.watchers.lock().await.keys().copied().collect()
    }

    /// Pushes every run's pending deltas through the given messenger
    pub async fn sync_tick(&self, messenger: &Messenger) {
        let watchers: Vec<_> = self.watchers.lock().await.values().cloned().collect();
        for watcher in watchers {
            if let Err(e) = watcher.sync().tick(messenger).await {
                warn!(run_id = %watcher.run_id(), error = %e, "synchronization push failed");
            }
        }
    }

    /// Ticks synchronization for as long as the process lives; a tick with no
    /// connection is a no-op and the deltas wait on disk
    pub async fn sync_loop(self: Arc<Self>, link: LinkHandle, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sync_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Some(messenger) = link.messenger() {
                        self.sync_tick(&messenger).await;
                    }
                }
            }
        }
    }

    /// Stops every executing run, bounded overall by the shutdown timeout
    pub async fn terminate_all(&self) {
        let watchers: Vec<_> = self.watchers.lock().await.values().cloned().collect();
        for watcher in &watchers {
            if !watcher.is_finished() {
                watcher.abort();
            }
        }
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        for watcher in &watchers {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            if !watcher.wait(remaining).await {
                error!(run_id = %watcher.run_id(), "run did not stop in time");
            }
        }
    }

    async fn resynchronize(&self, run_id: Uuid, reset: capstan_core::dto::SyncReset) {
        match self.watchers.lock().await.get(&run_id) {
            Some(watcher) => watcher.sync().resynchronize(reset).await,
            None => warn!(%run_id, "resynchronize for unknown run"),
        }
    }
}

#[async_trait]
impl MessageHandler for Worker {
    async fn handle_request(
        &self,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let command: WorkerCommand =
            serde_json::from_value(data).map_err(|e| format!("unparseable command: {e}"))?;
        match command {
            WorkerCommand::Describe => serde_json::to_value(DescribeReply {
                display_name: self.config.display_name.clone(),
                properties: self.config.properties.clone(),
            })
            .map_err(|e| e.to_string()),
            WorkerCommand::List => {
                let runs = self
                    .active_runs()
                    .await
                    .into_iter()
                    .map(|run_id| RunInFlight { run_id })
                    .collect();
                serde_json::to_value(ListReply { runs }).map_err(|e| e.to_string())
            }
            WorkerCommand::Execute(request) => {
                self.execute(request).await.map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            }
            WorkerCommand::Clean { run_id } => {
                self.clean(run_id).await.map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            }
            WorkerCommand::Abort { run_id } => {
                self.abort(run_id).await.map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            }
            WorkerCommand::Request { run_id } => {
                let request = self
                    .state
                    .load_request(run_id)
                    .await
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(request).map_err(|e| e.to_string())
            }
            WorkerCommand::Log { run_id, step } => {
                if !self.state.exists(run_id).await {
                    return Err(format!("run {run_id} not found"));
                }
                let content = self
                    .state
                    .read_log(run_id, step)
                    .await
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(LogReply { content }).map_err(|e| e.to_string())
            }
            WorkerCommand::Resynchronize { .. } | WorkerCommand::Shutdown => {
                Err("update-only command sent as a request".to_string())
            }
        }
    }

    async fn handle_update(&self, data: serde_json::Value) {
        let command: WorkerCommand = match serde_json::from_value(data) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "unparseable update");
                return;
            }
        };
        match command {
            WorkerCommand::Resynchronize { run_id, reset } => {
                self.resynchronize(run_id, reset).await;
            }
            WorkerCommand::Shutdown => {
                info!("shutdown requested by master");
                self.shutdown.cancel();
            }
            other => warn!(?other, "request-only command sent as an update"),
        }
    }
}
