//! Raft configuration parameters

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a consensus group member.
///
/// Replicated through `change_config` log entries and `InstallSnapshot`,
/// so every field must serialize. Plug-in modules (data ops, communication,
/// leader hook) are bound at server construction and are not part of this
/// struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Interval between heartbeats sent by the leader (default: 200ms)
    pub heartbeat_timeout: Duration,
    /// Base election timeout; actual timer durations are drawn from
    /// `[election_timeout, 2 * election_timeout)` (default: 1000ms)
    pub election_timeout: Duration,
    /// Committed entries kept behind the commit point to serve lagging
    /// followers; older followers receive InstallSnapshot (default: 100)
    pub max_retained_committed_logs: usize,
    /// Capacity of the command-id deduplication cache (default: 100)
    pub max_retained_command_results: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(200),
            election_timeout: Duration::from_millis(1000),
            max_retained_committed_logs: 100,
            max_retained_command_results: 100,
        }
    }
}

impl RaftConfig {
    /// Create a new config with custom heartbeat timeout
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Create a new config with custom election timeout
    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    /// Create a new config with custom committed-log retention
    pub fn with_max_retained_committed_logs(mut self, max: usize) -> Self {
        self.max_retained_committed_logs = max;
        self
    }

    /// Create a new config with custom command-result retention
    pub fn with_max_retained_command_results(mut self, max: usize) -> Self {
        self.max_retained_command_results = max;
        self
    }

    /// Validate the configuration.
    /// Rejected configs are fatal to the initiator at construction time.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_timeout.is_zero() {
            return Err("heartbeat_timeout must be positive".to_string());
        }
        if self.election_timeout.is_zero() {
            return Err("election_timeout must be positive".to_string());
        }
        if self.election_timeout <= self.heartbeat_timeout {
            return Err("election_timeout must exceed heartbeat_timeout".to_string());
        }
        if self.max_retained_committed_logs == 0 {
            return Err("max_retained_committed_logs must be positive".to_string());
        }
        if self.max_retained_command_results == 0 {
            return Err("max_retained_command_results must be positive".to_string());
        }
        Ok(())
    }

    /// Generate a random election timeout in `[election_timeout, 2 * election_timeout)`
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let base_ms = self.election_timeout.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(base_ms..base_ms * 2);
        Duration::from_millis(timeout_ms)
    }
}
