//! User data abstraction
//!
//! The data plug-in is the application value that the consensus group
//! replicates. When command entries commit they are applied to it; queries
//! read from it without going through the log when the leader lease allows.

use std::sync::{Arc, Mutex};

use crate::core::command_results::CommandResult;

/// Result of a read-only query against the user data
pub type QueryResult = Result<String, String>;

/// Deterministic user data replicated by the consensus group.
///
/// Implementations must be deterministic: applying the same commands in the
/// same order must produce the same data on every replica. Snapshots must
/// capture everything `restore` needs to reproduce the value bit-for-bit.
pub trait DataOps: Send + Sync + 'static {
    /// Apply a state-changing command, returning its result
    fn command(&mut self, arg: &str) -> CommandResult;

    /// Answer a read-only query against the current data
    fn query(&self, arg: &str) -> QueryResult;

    /// Serialize the current data for InstallSnapshot
    fn snapshot(&self) -> Result<Vec<u8>, String>;

    /// Replace the current data with a deserialized snapshot
    fn restore(&mut self, data: &[u8]) -> Result<(), String>;
}

/// Shared record of applied commands for testing
pub type AppliedCommands = Arc<Mutex<Vec<String>>>;

/// Test data plug-in that records every applied command to a shared vec
pub struct TestData {
    applied: AppliedCommands,
}

impl TestData {
    pub fn new() -> Self {
        TestData {
            applied: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create with a shared vec to inspect applied commands from outside
    pub fn new_shared(applied: AppliedCommands) -> Self {
        TestData { applied }
    }
}

impl Default for TestData {
    fn default() -> Self {
        Self::new()
    }
}

impl DataOps for TestData {
    fn command(&mut self, arg: &str) -> CommandResult {
        self.applied.lock().unwrap().push(arg.to_string());
        Ok(String::new())
    }

    fn query(&self, _arg: &str) -> QueryResult {
        Ok(format!("{}", self.applied.lock().unwrap().len()))
    }

    fn snapshot(&self) -> Result<Vec<u8>, String> {
        let applied = self.applied.lock().unwrap().clone();
        bincode::serialize(&applied).map_err(|e| format!("test data snapshot failed: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let applied: Vec<String> = bincode::deserialize(data)
            .map_err(|e| format!("test data restore failed: {}", e))?;
        *self.applied.lock().unwrap() = applied;
        Ok(())
    }
}
