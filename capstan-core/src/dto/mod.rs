//! DTOs for master/worker communication
//!
//! These are the payloads carried inside messenger frames: the RPC commands
//! the master issues to workers, the status/results/log updates workers push
//! back, and the connection handshake exchanged before any frame flows.

pub mod command;
pub mod handshake;
pub mod master;
pub mod sync;

pub use command::{
    DescribeReply, ExecuteRequest, ListReply, LogReply, RunInFlight, WorkerCommand,
};
pub use handshake::{Hello, HelloReply};
pub use master::{MasterCommand, TriggerReply, TriggerRequest};
pub use sync::{LogDelta, ResultsUpdate, RunUpdate, StatusUpdate, StepCursor, SyncReset};
