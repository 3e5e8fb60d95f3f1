//! Capstan master
//!
//! The master accepts worker connections, schedules pending runs onto
//! available workers, and tracks each run to completion through a per-worker
//! proxy state machine.
//!
//! Architecture:
//! - Supervisor: owns all active worker connections and their proxies
//! - WorkerProxy: per-connection executor state machine (execute/abort/clean)
//! - JobScheduler + WorkerSelector: periodic pending-run scan and placement
//! - TaskProcessor: ordered background runner for administrative actions
//! - Stores: narrow async traits over run/job/worker persistence

pub mod auth;
pub mod config;
pub mod error;
pub mod proxy;
pub mod scheduler;
pub mod selector;
pub mod store;
pub mod supervisor;
pub mod task_processor;

pub use config::MasterConfig;
pub use error::MasterError;
pub use scheduler::JobScheduler;
pub use supervisor::Supervisor;
