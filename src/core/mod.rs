//! Core consensus machinery: the replicated log, role state machine, and the
//! per-role bookkeeping it orchestrates.

pub mod command_results;
pub mod config;
pub mod election;
pub mod leadership;
pub mod log_entry;
pub mod logs;
pub mod members;
pub mod message;
pub mod raft_server;
