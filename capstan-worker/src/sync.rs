//! Per-run master synchronization
//!
//! Pushes a run's status, results, and log tails to the master as messenger
//! updates. The helper only tracks what it has already pushed; the state
//! directory is the source of truth, so a tick while disconnected is a no-op
//! and nothing is lost. Pushes are best-effort and retried next tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use capstan_core::domain::RunStatus;
use capstan_core::dto::{LogDelta, ResultsUpdate, RunUpdate, StatusUpdate, SyncReset};
use capstan_messenger::Messenger;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::WorkerError;
use crate::state::StateDir;

pub struct Synchronization {
    run_id: Uuid,
    state: Arc<StateDir>,
    step_count: usize,
    cursors: Mutex<SyncCursors>,
    disposed: AtomicBool,
}

#[derive(Debug)]
struct SyncCursors {
    /// Last (status, completed_at-present) pushed, to suppress repeats
    last_status: Option<(RunStatus, bool)>,
    results_sent: bool,
    /// Byte offset pushed so far, per step
    logs: Vec<u64>,
}

impl Synchronization {
    pub fn new(run_id: Uuid, state: Arc<StateDir>, step_count: usize) -> Self {
        Self {
            run_id,
            state,
            step_count,
            cursors: Mutex::new(SyncCursors {
                last_status: None,
                results_sent: false,
                logs: vec![0; step_count],
            }),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Pushes everything the master has not seen yet
    ///
    /// Cursors only advance once the corresponding update is enqueued, so a
    /// failed push is simply retried on the next tick.
    pub async fn tick(&self, messenger: &Messenger) -> Result<(), WorkerError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut cursors = self.cursors.lock().await;

        let status = self.state.load_status(self.run_id).await?;
        let fingerprint = (status.status, status.completed_at.is_some());
        if cursors.last_status != Some(fingerprint) {
            messenger.send_update(serde_json::to_value(RunUpdate::Status(StatusUpdate {
                run_id: self.run_id,
                status: status.status,
                started_at: status.started_at,
                completed_at: status.completed_at,
            }))?)?;
            cursors.last_status = Some(fingerprint);
            // Pipelines rewrite their results as they progress; push the
            // final document along with the terminal status
            if status.status.is_terminal() {
                cursors.results_sent = false;
            }
        }

        if !cursors.results_sent {
            if let Some(results) = self.state.load_results(self.run_id).await? {
                messenger.send_update(serde_json::to_value(RunUpdate::Results(ResultsUpdate {
                    run_id: self.run_id,
                    results,
                }))?)?;
                cursors.results_sent = true;
            }
        }

        for step in 0..self.step_count {
            let offset = cursors.logs[step];
            if self.state.log_len(self.run_id, step).await <= offset {
                continue;
            }
            let (data, read) = self.state.read_log_from(self.run_id, step, offset).await?;
            if read == 0 {
                continue;
            }
            messenger.send_update(serde_json::to_value(RunUpdate::Log(LogDelta {
                run_id: self.run_id,
                step,
                offset,
                data,
            }))?)?;
            cursors.logs[step] = offset + read;
        }

        Ok(())
    }

    /// Rewinds cursors to master-provided offsets after a master restart
    ///
    /// Status and results are re-pushed on the next tick since the restarted
    /// master may have lost them too.
    pub async fn resynchronize(&self, reset: SyncReset) {
        let mut cursors = self.cursors.lock().await;
        cursors.last_status = None;
        cursors.results_sent = false;
        for step in reset.steps {
            if step.index < cursors.logs.len() {
                cursors.logs[step.index] = step.log_cursor;
            }
        }
        debug!(run_id = %self.run_id, "synchronization cursors rewound");
    }

    /// Stops all further pushes; called when the run is cleaned
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StatusDoc;
    use async_trait::async_trait;
    use capstan_core::dto::StepCursor;
    use capstan_messenger::{Connection, MessageHandler, MessengerError};
    use std::collections::HashMap;
    use std::time::Duration;

    struct Recorder(tokio::sync::mpsc::UnboundedSender<RunUpdate>);

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle_request(
            &self,
            _data: serde_json::Value,
        ) -> Result<serde_json::Value, String> {
            Err("unsupported".to_string())
        }

        async fn handle_update(&self, data: serde_json::Value) {
            if let Ok(update) = serde_json::from_value(data) {
                let _ = self.0.send(update);
            }
        }
    }

    async fn linked_recorder() -> (
        Messenger,
        tokio::sync::mpsc::UnboundedReceiver<RunUpdate>,
    ) {
        let (left, right) = capstan_messenger::connection::pair();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let pusher = Messenger::new(
            Arc::new(left) as Arc<dyn Connection>,
            Arc::new(capstan_messenger::NullHandler),
        );
        let receiver = Messenger::new(
            Arc::new(right) as Arc<dyn Connection>,
            Arc::new(Recorder(tx)),
        );
        for messenger in [pusher.clone(), receiver] {
            tokio::spawn(async move {
                let _ = messenger.run().await;
            });
        }
        (pusher, rx)
    }

    async fn recv(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<RunUpdate>,
    ) -> RunUpdate {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("update should arrive")
            .expect("channel open")
    }

    fn request(run_id: Uuid) -> capstan_core::dto::ExecuteRequest {
        use capstan_core::domain::{Job, JobDefinition, JobProperties};
        capstan_core::dto::ExecuteRequest {
            run_id,
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
        }
    }

    #[tokio::test]
    async fn test_pushes_status_once_then_log_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateDir::new(dir.path()));
        let run_id = Uuid::new_v4();
        state.save_request(&request(run_id)).await.unwrap();
        state
            .save_status(run_id, &StatusDoc::pending())
            .await
            .unwrap();

        let (messenger, mut rx) = linked_recorder().await;
        let sync = Synchronization::new(run_id, Arc::clone(&state), 1);

        sync.tick(&messenger).await.unwrap();
        assert!(matches!(recv(&mut rx).await, RunUpdate::Status(ref s) if s.status == RunStatus::Pending));

        // Unchanged status is not re-pushed; new log bytes are
        tokio::fs::write(state.log_path(run_id, 0), b"hello\n")
            .await
            .unwrap();
        sync.tick(&messenger).await.unwrap();
        match recv(&mut rx).await {
            RunUpdate::Log(delta) => {
                assert_eq!(delta.offset, 0);
                assert_eq!(delta.data, "hello\n");
            }
            other => panic!("expected log delta, got {other:?}"),
        }

        // Only the tail goes out on the next tick
        tokio::fs::write(state.log_path(run_id, 0), b"hello\nworld\n")
            .await
            .unwrap();
        sync.tick(&messenger).await.unwrap();
        match recv(&mut rx).await {
            RunUpdate::Log(delta) => {
                assert_eq!(delta.offset, 6);
                assert_eq!(delta.data, "world\n");
            }
            other => panic!("expected log delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resynchronize_rewinds_and_repushes() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateDir::new(dir.path()));
        let run_id = Uuid::new_v4();
        state.save_request(&request(run_id)).await.unwrap();
        state
            .save_status(run_id, &StatusDoc::pending())
            .await
            .unwrap();
        tokio::fs::write(state.log_path(run_id, 0), b"hello\n")
            .await
            .unwrap();

        let (messenger, mut rx) = linked_recorder().await;
        let sync = Synchronization::new(run_id, Arc::clone(&state), 1);

        sync.tick(&messenger).await.unwrap();
        assert!(matches!(recv(&mut rx).await, RunUpdate::Status(_)));
        assert!(matches!(recv(&mut rx).await, RunUpdate::Log(_)));

        sync.resynchronize(SyncReset {
            steps: vec![StepCursor {
                index: 0,
                log_cursor: 0,
            }],
        })
        .await;

        sync.tick(&messenger).await.unwrap();
        assert!(matches!(recv(&mut rx).await, RunUpdate::Status(_)));
        match recv(&mut rx).await {
            RunUpdate::Log(delta) => assert_eq!(delta.offset, 0),
            other => panic!("expected log delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disposed_sync_pushes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateDir::new(dir.path()));
        let run_id = Uuid::new_v4();
        state.save_request(&request(run_id)).await.unwrap();
        state
            .save_status(run_id, &StatusDoc::pending())
            .await
            .unwrap();

        let (messenger, mut rx) = linked_recorder().await;
        let sync = Synchronization::new(run_id, state, 1);
        sync.dispose();
        sync.tick(&messenger).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_push_is_retried_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateDir::new(dir.path()));
        let run_id = Uuid::new_v4();
        state.save_request(&request(run_id)).await.unwrap();
        state
            .save_status(run_id, &StatusDoc::pending())
            .await
            .unwrap();

        let (dead, _) = capstan_messenger::connection::pair();
        let dead = Messenger::new(
            Arc::new(dead) as Arc<dyn Connection>,
            Arc::new(capstan_messenger::NullHandler),
        );
        dead.dispose();

        let sync = Synchronization::new(run_id, Arc::clone(&state), 1);
        let err = sync.tick(&dead).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Messenger(MessengerError::Cancelled)
        ));

        // Nothing was marked pushed; a live messenger gets the full state
        let (messenger, mut rx) = linked_recorder().await;
        sync.tick(&messenger).await.unwrap();
        assert!(matches!(recv(&mut rx).await, RunUpdate::Status(_)));
    }
}
