//! Ordered background-task runner
//!
//! Administrative actions (configuration reload and the like) are queued
//! here and run strictly in order on a single consumer task. Individual task
//! failures are logged and swallowed; the queue keeps moving.

use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type AdminTask = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

pub struct TaskProcessor {
    tx: mpsc::UnboundedSender<(String, AdminTask)>,
}

impl TaskProcessor {
    /// Spawns the consumer loop and returns the enqueue handle
    pub fn spawn(cancel: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, AdminTask)>();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => next,
                };
                let Some((name, task)) = next else { break };
                debug!(task = %name, "running administrative task");
                if let Err(e) = task.await {
                    error!(task = %name, error = %e, "administrative task failed");
                }
            }
            info!("task processor stopped");
        });

        Self { tx }
    }

    /// Enqueues a task; returns false if the processor has stopped
    pub fn enqueue<F>(&self, name: impl Into<String>, task: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tx.send((name.into(), Box::pin(task))).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_tasks_run_in_enqueue_order() {
        let cancel = CancellationToken::new();
        let processor = TaskProcessor::spawn(cancel.clone());

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            processor.enqueue(format!("task-{i}"), async move {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_failed_task_does_not_stop_queue() {
        let cancel = CancellationToken::new();
        let processor = TaskProcessor::spawn(cancel.clone());

        let ran = Arc::new(AtomicUsize::new(0));
        processor.enqueue("bad", async { anyhow::bail!("boom") });
        {
            let ran = Arc::clone(&ran);
            processor.enqueue("good", async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }
}
