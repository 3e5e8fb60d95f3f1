//! Core types for Capstan
//!
//! This crate contains:
//! - Shared domain types (Run, Job, WorkerRecord, pipeline elements)
//! - DTOs for the master/worker RPC commands and the connection handshake
//!
//! Note: persistence lives behind store traits in capstan-master, execution
//! logic in capstan-worker. This crate is types only.

pub mod domain;
pub mod dto;
