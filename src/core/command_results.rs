//! Bounded command-id -> result cache for at-most-once command application

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::log_entry::CommandId;

/// Result of applying a command to the user data
pub type CommandResult = Result<String, String>;

/// Insertion-ordered bounded mapping from command id to cached result.
///
/// Every replica consults this cache before applying a committed command, so
/// a retried command (same id) is applied at most once per replica. The
/// cache travels in `InstallSnapshot` so joining followers inherit it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResults {
    results: HashMap<CommandId, CommandResult>,
    insertion_order: VecDeque<CommandId>,
}

impl CommandResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached result for a command id
    pub fn fetch(&self, id: CommandId) -> Option<&CommandResult> {
        self.results.get(&id)
    }

    /// Cache a result, evicting the oldest insertion once over capacity
    pub fn put(&mut self, id: CommandId, result: CommandResult, max: usize) {
        if self.results.insert(id, result).is_none() {
            self.insertion_order.push_back(id);
        }
        while self.insertion_order.len() > max {
            if let Some(oldest) = self.insertion_order.pop_front() {
                self.results.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.insertion_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insertion_order.is_empty()
    }
}
