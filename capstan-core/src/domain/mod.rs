//! Domain types shared between master and worker

pub mod job;
pub mod pipeline;
pub mod run;
pub mod worker;

pub use job::{Job, JobDefinition, JobProperties};
pub use pipeline::{ElementGate, PipelineElement};
pub use run::{Run, RunStatus};
pub use worker::{WorkerProperties, WorkerRecord};
