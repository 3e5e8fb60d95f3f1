//! Connection to the master
//!
//! The link loop connects, performs the handshake, then drives a messenger
//! until the connection dies, retrying with a bounded backoff. Execution
//! never depends on the link being up; the rest of the worker reaches the
//! current messenger, if any, through a `LinkHandle`.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use capstan_core::domain::Run;
use capstan_core::dto::{Hello, HelloReply, MasterCommand, TriggerReply, TriggerRequest};
use capstan_messenger::connection::TcpConnection;
use capstan_messenger::{Connection, MessageHandler, Messenger, MessengerError};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::executor::{RunLookup, RunTrigger};

/// Retry delays in seconds; the last entry repeats
const BACKOFF_SECONDS: [u64; 6] = [1, 2, 5, 10, 30, 60];

/// Shared view of the currently connected messenger
#[derive(Clone, Default)]
pub struct LinkHandle {
    current: Arc<RwLock<Option<Messenger>>>,
}

impl LinkHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messenger(&self) -> Option<Messenger> {
        self.current.read().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.current.read().unwrap().is_some()
    }

    fn set(&self, messenger: Messenger) {
        *self.current.write().unwrap() = Some(messenger);
    }

    fn clear(&self) {
        *self.current.write().unwrap() = None;
    }
}

pub struct MasterLink {
    config: WorkerConfig,
    handler: Arc<dyn MessageHandler>,
    handle: LinkHandle,
    stop: CancellationToken,
}

impl MasterLink {
    pub fn new(
        config: WorkerConfig,
        handler: Arc<dyn MessageHandler>,
        handle: LinkHandle,
        stop: CancellationToken,
    ) -> Self {
        Self {
            config,
            handler,
            handle,
            stop,
        }
    }

    /// Connects and reconnects until stopped
    ///
    /// A rejected handshake ends the attempt, not the process; the worker may
    /// be waiting out a duplicate registration that will clear.
    pub async fn run(&self) {
        let mut failures: usize = 0;
        loop {
            if self.stop.is_cancelled() {
                info!("link loop stopped");
                return;
            }
            match self.connect_once().await {
                Ok(()) => failures = 0,
                Err(WorkerError::Rejected(reason)) => {
                    error!(%reason, "master rejected registration");
                    failures += 1;
                }
                Err(e) => {
                    warn!(error = %e, "connection attempt failed");
                    failures += 1;
                }
            }
            if self.stop.is_cancelled() {
                return;
            }

            let index = failures.saturating_sub(1).min(BACKOFF_SECONDS.len() - 1);
            let delay = Duration::from_secs(BACKOFF_SECONDS[index]);
            debug!(seconds = delay.as_secs(), "reconnecting after delay");
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_once(&self) -> Result<(), WorkerError> {
        let stream = tokio::net::TcpStream::connect(&self.config.master_addr).await?;
        let connection = Arc::new(TcpConnection::new(stream));

        let hello = Hello {
            token: self.config.token.clone(),
            worker: self.config.worker_id.clone(),
            version: self.config.version.clone(),
            display_name: self.config.display_name.clone(),
            properties: self.config.properties.clone(),
        };
        connection.send(&serde_json::to_vec(&hello)?).await?;
        let frame = connection
            .recv()
            .await?
            .ok_or(MessengerError::ConnectionClosed)?;
        let reply: HelloReply = serde_json::from_slice(&frame)?;
        match reply {
            HelloReply::Accepted => {}
            HelloReply::Rejected { reason } => {
                connection.close().await;
                return Err(WorkerError::Rejected(reason));
            }
        }
        info!(addr = %self.config.master_addr, "registered with master");

        let messenger = Messenger::new(connection, Arc::clone(&self.handler));
        self.handle.set(messenger.clone());
        let result = tokio::select! {
            r = messenger.run() => r.map_err(WorkerError::from),
            _ = self.stop.cancelled() => {
                messenger.dispose();
                Ok(())
            }
        };
        self.handle.clear();
        info!("disconnected from master");
        result
    }
}

/// Triggers and polls runs through the connected master
///
/// Fails with an invalid-state error while disconnected; pipeline executors
/// treat that as transient and retry.
pub struct MasterRunClient {
    handle: LinkHandle,
}

impl MasterRunClient {
    pub fn new(handle: LinkHandle) -> Self {
        Self { handle }
    }

    fn connected(&self) -> Result<Messenger, WorkerError> {
        self.handle
            .messenger()
            .ok_or_else(|| WorkerError::InvalidState("not connected to master".to_string()))
    }
}

#[async_trait]
impl RunTrigger for MasterRunClient {
    async fn trigger_job(
        &self,
        project: &str,
        job: &str,
        parameters: HashMap<String, serde_json::Value>,
        source: &str,
    ) -> Result<Uuid, WorkerError> {
        let messenger = self.connected()?;
        let command = MasterCommand::TriggerRun(TriggerRequest {
            project: project.to_string(),
            job: job.to_string(),
            parameters,
            source: source.to_string(),
        });
        let reply = messenger
            .send_request(serde_json::to_value(command)?)
            .await?;
        let reply: TriggerReply = serde_json::from_value(reply)?;
        Ok(reply.run_id)
    }
}

#[async_trait]
impl RunLookup for MasterRunClient {
    async fn get_run(&self, run_id: Uuid) -> Result<Run, WorkerError> {
        let messenger = self.connected()?;
        let reply = messenger
            .send_request(serde_json::to_value(MasterCommand::GetRun { run_id })?)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }
}
