//! Worker-connection supervisor
//!
//! Accepts worker connections, authenticates and registers them, and owns
//! one `WorkerProxy` per active connection. Each connection is handled on its
//! own task, so a wedged worker never blocks the others.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use capstan_core::domain::{Job, Run, WorkerRecord};
use capstan_core::dto::{Hello, HelloReply, MasterCommand, RunUpdate, TriggerReply};
use capstan_messenger::connection::TcpConnection;
use capstan_messenger::{Connection, MessageHandler, Messenger};

use crate::auth::Authorizer;
use crate::config::MasterConfig;
use crate::error::MasterError;
use crate::proxy::WorkerProxy;
use crate::store::{RunStore, WorkerStore};

pub struct Supervisor {
    config: MasterConfig,
    run_store: Arc<dyn RunStore>,
    worker_store: Arc<dyn WorkerStore>,
    authorizer: Arc<dyn Authorizer>,
    proxies: Mutex<HashMap<String, Arc<WorkerProxy>>>,
}

impl Supervisor {
    pub fn new(
        config: MasterConfig,
        run_store: Arc<dyn RunStore>,
        worker_store: Arc<dyn WorkerStore>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            run_store,
            worker_store,
            authorizer,
            proxies: Mutex::new(HashMap::new()),
        })
    }

    /// Accept loop; one task per connection, runs until cancelled
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), MasterError> {
        info!(addr = %listener.local_addr()?, "supervisor listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let supervisor = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = supervisor.handle_connection(stream).await {
                            warn!(%peer, error = %e, "worker connection ended with error");
                        }
                    });
                }
            }
        }
    }

    /// Periodic record scan flagging workers for graceful disconnect
    pub async fn update_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.supervisor_tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.update().await {
                        error!(error = %e, "supervisor tick failed");
                    }
                }
            }
        }
    }

    /// One supervisor tick: propagate `should_disconnect` flags to proxies
    pub async fn update(&self) -> Result<(), MasterError> {
        let proxies = self.proxies.lock().await;
        for (name, proxy) in proxies.iter() {
            if let Some(record) = self.worker_store.get(name).await? {
                if record.should_disconnect {
                    proxy.flag_shutdown();
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: tokio::net::TcpStream) -> Result<(), MasterError> {
        let connection = Arc::new(TcpConnection::new(stream));

        let frame = connection
            .recv()
            .await?
            .ok_or(capstan_messenger::MessengerError::ConnectionClosed)?;
        let hello: Hello = serde_json::from_slice(&frame).map_err(|e| {
            capstan_messenger::MessengerError::Protocol(format!("bad hello: {e}"))
        })?;

        let record = match self.register(&hello).await {
            Ok(record) => record,
            Err(e) => {
                info!(worker = %hello.worker, reason = %e, "connection refused");
                let reply = HelloReply::Rejected {
                    reason: e.to_string(),
                };
                let _ = connection.send(&serde_json::to_vec(&reply)?).await;
                connection.close().await;
                return Ok(());
            }
        };
        let name = record.name.clone();

        let handler = Arc::new(WorkerChannelHandler {
            run_store: Arc::clone(&self.run_store),
            worker: name.clone(),
        });
        let messenger = Messenger::new(
            Arc::clone(&connection) as Arc<dyn Connection>,
            handler,
        );
        let proxy = Arc::new(WorkerProxy::new(
            name.clone(),
            messenger.clone(),
            Arc::clone(&self.run_store),
            self.config.proxy_tick,
        ));

        // The name is claimed under the same lock acquisition that checks it,
        // so two simultaneous connections for one worker cannot both pass
        // register and clobber each other's proxy
        {
            let mut proxies = self.proxies.lock().await;
            if proxies.contains_key(&name) {
                drop(proxies);
                info!(worker = %name, "connection refused: worker already active");
                let reply = HelloReply::Rejected {
                    reason: format!("worker {name} is already active"),
                };
                let _ = connection.send(&serde_json::to_vec(&reply)?).await;
                connection.close().await;
                messenger.dispose();
                return Ok(());
            }
            proxies.insert(name.clone(), Arc::clone(&proxy));
        }

        if let Err(e) = connection
            .send(&serde_json::to_vec(&HelloReply::Accepted)?)
            .await
        {
            self.proxies.lock().await.remove(&name);
            messenger.dispose();
            return Err(e.into());
        }
        info!(worker = %name, owner = %record.owner, "worker registered");
        self.set_active(&name, true).await;

        let pump = {
            let messenger = messenger.clone();
            tokio::spawn(async move { messenger.run().await })
        };

        let drive_result = proxy.drive().await;
        messenger.dispose();
        let pump_result = pump.await;

        // Always mark inactive, whatever ended the connection
        self.proxies.lock().await.remove(&name);
        self.set_active(&name, false).await;

        match &drive_result {
            Ok(()) => info!(worker = %name, "worker disconnected"),
            Err(e) => warn!(worker = %name, error = %e, "worker connection failed"),
        }
        if let Ok(Err(e)) = pump_result {
            if e.is_fatal() {
                warn!(worker = %name, error = %e, "messenger ended with error");
            }
        }
        drive_result
    }

    /// Look up or create the worker record, refusing duplicates and
    /// mismatched owners
    async fn register(&self, hello: &Hello) -> Result<WorkerRecord, MasterError> {
        let owner = self.authorizer.authenticate(&hello.token).await?;

        if self.proxies.lock().await.contains_key(&hello.worker) {
            return Err(MasterError::Registration(format!(
                "worker {} is already active",
                hello.worker
            )));
        }

        match self.worker_store.get(&hello.worker).await? {
            Some(mut record) => {
                if record.is_active {
                    return Err(MasterError::Registration(format!(
                        "worker {} is already active",
                        hello.worker
                    )));
                }
                if record.owner != owner {
                    return Err(MasterError::Registration(format!(
                        "worker {} is registered to a different owner",
                        hello.worker
                    )));
                }
                record.version = hello.version.clone();
                record.display_name = hello.display_name.clone();
                record.properties = hello.properties.clone();
                self.worker_store.update(&record).await?;
                Ok(record)
            }
            None => {
                let mut record = WorkerRecord::new(&hello.worker, owner, &hello.version);
                record.display_name = hello.display_name.clone();
                record.properties = hello.properties.clone();
                self.worker_store.create(record.clone()).await?;
                Ok(record)
            }
        }
    }

    async fn set_active(&self, name: &str, active: bool) {
        match self.worker_store.get(name).await {
            Ok(Some(mut record)) => {
                record.is_active = active;
                if let Err(e) = self.worker_store.update(&record).await {
                    error!(worker = %name, error = %e, "failed to update worker record");
                }
            }
            Ok(None) => warn!(worker = %name, "worker record vanished"),
            Err(e) => error!(worker = %name, error = %e, "failed to load worker record"),
        }
    }

    /// True only if the worker is connected, enabled, and not flagged for
    /// disconnect
    pub async fn is_worker_available(&self, name: &str) -> bool {
        let connected = match self.proxies.lock().await.get(name) {
            Some(proxy) => proxy.is_ready(),
            None => false,
        };
        if !connected {
            return false;
        }
        match self.worker_store.get(name).await {
            Ok(Some(record)) => record.is_enabled && !record.should_disconnect,
            _ => false,
        }
    }

    pub async fn available_workers(&self) -> Vec<String> {
        let names: Vec<String> = self.proxies.lock().await.keys().cloned().collect();
        let mut available = Vec::new();
        for name in names {
            if self.is_worker_available(&name).await {
                available.push(name);
            }
        }
        available
    }

    pub async fn executor_count(&self, name: &str) -> usize {
        match self.proxies.lock().await.get(name) {
            Some(proxy) => proxy.executor_count().await,
            None => 0,
        }
    }

    /// Hands a run to the named worker's proxy
    pub async fn assign_run(&self, name: &str, job: Job, run: &Run) -> Result<(), MasterError> {
        let proxy = {
            let proxies = self.proxies.lock().await;
            proxies
                .get(name)
                .cloned()
                .ok_or_else(|| MasterError::NotFound(format!("worker {name} is not connected")))?
        };
        proxy.assign_run(job, run).await
    }

    /// Flags a running run's executor for abort; false if the worker is not
    /// connected or does not hold the run
    pub async fn flag_abort(&self, worker: &str, run_id: Uuid) -> bool {
        let proxy = self.proxies.lock().await.get(worker).cloned();
        match proxy {
            Some(proxy) => proxy.flag_abort(run_id).await,
            None => false,
        }
    }
}

/// Applies a worker's status/results/log pushes to the run store and answers
/// its trigger/lookup requests (used by controller workers running pipelines)
struct WorkerChannelHandler {
    run_store: Arc<dyn RunStore>,
    worker: String,
}

#[async_trait]
impl MessageHandler for WorkerChannelHandler {
    async fn handle_request(
        &self,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let command: MasterCommand =
            serde_json::from_value(data).map_err(|e| format!("unparseable command: {e}"))?;
        match command {
            MasterCommand::TriggerRun(request) => {
                let run = Run::new(
                    request.project,
                    request.job,
                    request.parameters,
                    request.source,
                );
                let run_id = run.id;
                self.run_store
                    .create(run)
                    .await
                    .map_err(|e| e.to_string())?;
                info!(worker = %self.worker, run_id = %run_id, "run triggered by worker");
                serde_json::to_value(TriggerReply { run_id }).map_err(|e| e.to_string())
            }
            MasterCommand::GetRun { run_id } => {
                let run = self
                    .run_store
                    .get(run_id)
                    .await
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("run {run_id} not found"))?;
                serde_json::to_value(run).map_err(|e| e.to_string())
            }
        }
    }

    async fn handle_update(&self, data: serde_json::Value) {
        let update: RunUpdate = match serde_json::from_value(data) {
            Ok(update) => update,
            Err(e) => {
                warn!(worker = %self.worker, error = %e, "unparseable run update");
                return;
            }
        };
        let result = match update {
            RunUpdate::Status(s) => {
                self.run_store
                    .update_status(s.run_id, s.status, s.started_at, s.completed_at)
                    .await
            }
            RunUpdate::Results(r) => self.run_store.set_results(r.run_id, r.results).await,
            RunUpdate::Log(d) => {
                self.run_store
                    .append_log(d.run_id, d.step, d.offset, d.data.as_bytes())
                    .await
            }
        };
        if let Err(e) = result {
            warn!(worker = %self.worker, error = %e, "failed to apply run update");
        }
    }
}
