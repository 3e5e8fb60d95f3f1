//! Capstan worker
//!
//! A worker connects to the master, receives execute commands, and carries
//! runs out as subprocesses while pushing status, results, and log deltas
//! back over the messenger.
//!
//! Architecture:
//! - ProcessWatcher: one supervised OS subprocess with streamed output
//! - Executor family: JobExecutor (command sequences) and PipelineExecutor
//!   (DAGs of triggered sub-jobs) behind a common state machine
//! - ExecutorWatcher + Synchronization: per-run task plus master push helper
//! - Worker: command dispatch and executor ownership
//! - MasterLink: connect/handshake/reconnect loop with bounded backoff
//!
//! Runs keep executing through master disconnects; state is buffered on disk
//! and synchronized when the link returns.

pub mod config;
pub mod error;
pub mod executor;
pub mod link;
pub mod process_watcher;
pub mod state;
pub mod sync;
pub mod watcher;
pub mod worker;

pub use config::WorkerConfig;
pub use error::WorkerError;
pub use worker::Worker;
