//! Subprocess supervision
//!
//! One `ProcessWatcher` per spawned command. Stdout and stderr are merged by
//! reading both through line-reader tasks that forward into a single sink, so
//! the per-step log sees output in arrival order.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("command exited with status {code}")]
    NonZeroExit { code: i32 },

    /// Exited without a code, i.e. killed by a signal
    #[error("command terminated by signal")]
    Signalled,

    #[error("empty command")]
    EmptyCommand,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A spawned subprocess with its output readers
#[derive(Debug)]
pub struct ProcessWatcher {
    child: Child,
    pid: Option<u32>,
    readers: Vec<JoinHandle<()>>,
    command_line: String,
}

impl ProcessWatcher {
    /// Spawns `argv` in `workdir` with `envs` added to the environment,
    /// forwarding every output line to `sink`
    pub fn start(
        argv: &[String],
        workdir: &Path,
        envs: &HashMap<String, String>,
        sink: mpsc::UnboundedSender<String>,
    ) -> Result<Self, ProcessError> {
        let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;
        let command_line = argv.join(" ");

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(workdir)
            .envs(envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Leader of its own process group, so terminate() reaches any
        // subprocesses the command forks
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let pid = child.id();
        debug!(command = %command_line, pid, "subprocess started");

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, sink));
        }

        Ok(Self {
            child,
            pid,
            readers,
            command_line,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking liveness poll
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Waits for exit, then drains remaining output with a bounded timeout
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, ProcessError> {
        let status = self.child.wait().await?;
        self.drain().await;
        Ok(status)
    }

    /// Like [`wait`](Self::wait) but turns failure statuses into errors
    pub async fn complete(&mut self) -> Result<(), ProcessError> {
        let status = self.wait().await?;
        if status.success() {
            return Ok(());
        }
        match status.code() {
            Some(code) => Err(ProcessError::NonZeroExit { code }),
            None => Err(ProcessError::Signalled),
        }
    }

    /// Graceful termination: signal, bounded wait, force-kill if still alive
    pub async fn terminate(&mut self, reason: &str, grace: Duration) -> Result<(), ProcessError> {
        info!(command = %self.command_line, pid = self.pid, reason, "terminating subprocess");

        if let Some(pid) = self.pid {
            if signal_group(pid, "TERM").await {
                if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
                    self.drain().await;
                    return Ok(());
                }
                warn!(pid, "process group ignored termination signal, killing");
            } else {
                debug!(pid, "termination signal not delivered, killing");
            }
            signal_group(pid, "KILL").await;
        }

        self.child.kill().await?;
        self.drain().await;
        Ok(())
    }

    async fn drain(&mut self) {
        for mut reader in self.readers.drain(..) {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await.is_err() {
                // An orphan holding the pipe open must not stall the step
                warn!(command = %self.command_line, "output drain timed out, abandoning reader");
                reader.abort();
            }
        }
    }
}

/// Signals the command's whole process group; the child is its leader
async fn signal_group(pid: u32, signal: &str) -> bool {
    let status = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .status()
        .await;
    matches!(status, Ok(status) if status.success())
}

fn spawn_line_reader<R>(stream: R, sink: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if sink.send(line).is_err() {
                return;
            }
        }
    })
}
