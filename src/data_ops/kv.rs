//! Simple key-value store data plug-in
//!
//! Commands (state-changing operations that go through the log):
//! - `SET key value` - Set a key to a value, returns Ok("")
//! - `DELETE key` - Delete a key, returns Ok("") or Err("NOT_FOUND")
//!
//! Queries (read-only, answered under the leader lease when possible):
//! - `GET key` - returns Ok(value) or Err("NOT_FOUND")

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::command_results::CommandResult;

use super::{DataOps, QueryResult};

/// Simple in-memory key-value store
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        KeyValueStore {
            data: HashMap::new(),
        }
    }

    /// Read a value directly, bypassing the query protocol
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }
}

impl DataOps for KeyValueStore {
    fn command(&mut self, arg: &str) -> CommandResult {
        let parts: Vec<&str> = arg.splitn(3, ' ').collect();

        match parts.as_slice() {
            ["SET", key, value] => {
                self.data.insert(key.to_string(), value.to_string());
                Ok(String::new())
            }
            ["DELETE", key] => {
                if self.data.remove(*key).is_some() {
                    Ok(String::new())
                } else {
                    Err("NOT_FOUND".to_string())
                }
            }
            _ => Err(format!("unknown command: {}", arg)),
        }
    }

    fn query(&self, arg: &str) -> QueryResult {
        let parts: Vec<&str> = arg.splitn(2, ' ').collect();

        match parts.as_slice() {
            ["GET", key] => self.get(key).ok_or_else(|| "NOT_FOUND".to_string()),
            _ => Err(format!("unknown query: {}", arg)),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(&self.data).map_err(|e| format!("snapshot serialization failed: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let restored: HashMap<String, String> = bincode::deserialize(data)
            .map_err(|e| format!("snapshot deserialization failed: {}", e))?;
        self.data = restored;
        Ok(())
    }
}
