//! User data plug-ins replicated by the consensus group

pub mod kv;
pub mod traits;

pub use traits::{AppliedCommands, DataOps, QueryResult, TestData};
