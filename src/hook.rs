//! Best-effort observer callbacks fired by the leader
//!
//! Hooks observe the replica; they cannot feed errors back into it. The
//! trait's methods are infallible by construction, so a misbehaving hook has
//! no channel through which to corrupt consensus state.

use std::sync::{Arc, Mutex};

use crate::core::command_results::CommandResult;
use crate::core::log_entry::{CommandId, NodeId};

/// Observer callbacks invoked on the leader as cluster events commit.
/// All methods default to no-ops.
pub trait LeaderHook: Send + Sync + 'static {
    /// This replica won an election (fired when its `leader_elected` entry
    /// is appended)
    fn on_elected(&mut self) {}

    /// A command entry committed and was applied
    fn on_command_committed(&mut self, _id: CommandId, _arg: &str, _result: &CommandResult) {}

    /// A logged query committed and was answered
    fn on_query_answered(&mut self, _arg: &str) {}

    /// An `add_follower` entry committed
    fn on_follower_added(&mut self, _follower: NodeId) {}

    /// A `remove_follower` entry committed
    fn on_follower_removed(&mut self, _follower: NodeId) {}
}

/// The default hook: observes nothing
pub struct NoopHook;

impl LeaderHook for NoopHook {}

/// Cluster events recorded by [`RecordingHook`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    Elected,
    CommandCommitted(CommandId),
    QueryAnswered(String),
    FollowerAdded(NodeId),
    FollowerRemoved(NodeId),
}

/// Shared event record for inspecting hook calls from tests
pub type HookEvents = Arc<Mutex<Vec<HookEvent>>>;

/// Test hook that records every callback to a shared vec
pub struct RecordingHook {
    events: HookEvents,
}

impl RecordingHook {
    pub fn new_shared(events: HookEvents) -> Self {
        RecordingHook { events }
    }
}

impl LeaderHook for RecordingHook {
    fn on_elected(&mut self) {
        self.events.lock().unwrap().push(HookEvent::Elected);
    }

    fn on_command_committed(&mut self, id: CommandId, _arg: &str, _result: &CommandResult) {
        self.events
            .lock()
            .unwrap()
            .push(HookEvent::CommandCommitted(id));
    }

    fn on_query_answered(&mut self, arg: &str) {
        self.events
            .lock()
            .unwrap()
            .push(HookEvent::QueryAnswered(arg.to_string()));
    }

    fn on_follower_added(&mut self, follower: NodeId) {
        self.events
            .lock()
            .unwrap()
            .push(HookEvent::FollowerAdded(follower));
    }

    fn on_follower_removed(&mut self, follower: NodeId) {
        self.events
            .lock()
            .unwrap()
            .push(HookEvent::FollowerRemoved(follower));
    }
}
