//! Per-run watcher
//!
//! One watcher per run the worker knows about. A spawned watcher owns the
//! execution task; an observed watcher wraps a run recovered from disk whose
//! subprocess is long gone and only exposes its state for synchronization.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::executor::{self, ExecutionContext};
use crate::sync::Synchronization;

pub struct ExecutorWatcher {
    run_id: Uuid,
    sync: Arc<Synchronization>,
    abort: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl ExecutorWatcher {
    /// Starts executing a run on its own task
    pub fn spawn(ctx: ExecutionContext, sync: Arc<Synchronization>) -> Arc<Self> {
        let run_id = ctx.request.run_id;
        let abort = ctx.abort.clone();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&finished);
        tokio::spawn(async move {
            executor::run(ctx).await;
            flag.store(true, Ordering::SeqCst);
        });

        Arc::new(Self {
            run_id,
            sync,
            abort,
            finished,
        })
    }

    /// Wraps a run recovered from disk; nothing left to execute
    pub fn observe(run_id: Uuid, sync: Arc<Synchronization>) -> Arc<Self> {
        Arc::new(Self {
            run_id,
            sync,
            abort: CancellationToken::new(),
            finished: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn sync(&self) -> &Arc<Synchronization> {
        &self.sync
    }

    /// Whether the execution task has written its terminal status
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Asks the execution to stop; the running subprocess is terminated
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Waits for the execution task to finish, up to `timeout`
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_finished() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}
