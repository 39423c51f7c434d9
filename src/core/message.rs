//! Wire messages exchanged between replicas
//!
//! All messages are fire-and-forget events; the transport may drop, reorder,
//! or duplicate them. Every message that participates in the consensus
//! protocol carries the sender's term.

use serde::{Deserialize, Serialize};

use super::command_results::CommandResults;
use super::config::RaftConfig;
use super::log_entry::{LogEntry, LogIndex, NodeId, TermNumber};
use super::members::Members;

/// Log replication request (also the heartbeat, with empty `entries`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: TermNumber,
    pub leader: NodeId,
    /// Term of the entry immediately preceding `entries`
    pub prev_log_term: TermNumber,
    /// Index of the entry immediately preceding `entries`
    pub prev_log_index: LogIndex,
    pub entries: Vec<LogEntry>,
    /// Leader's commit index
    pub i_leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub from: NodeId,
    pub term: TermNumber,
    pub success: bool,
    /// Highest index replicated on the follower; absent on failure
    pub i_replicated: Option<LogIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: TermNumber,
    pub candidate: NodeId,
    /// (term, index) of the candidate's last log entry
    pub last_log: (TermNumber, LogIndex),
    /// Set when the candidacy was triggered by TimeoutNow; grants bypass the
    /// receivers' leader-lease guard
    pub replacing_leader: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub from: NodeId,
    pub term: TermNumber,
    pub vote_granted: bool,
}

/// Bulk state transfer: sent to a joining follower, or to one whose log has
/// been truncated past its next index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshot {
    pub members: Members,
    pub term: TermNumber,
    pub last_committed_entry: LogEntry,
    /// Serialized user data (`DataOps::snapshot`)
    pub data: Vec<u8>,
    pub command_results: CommandResults,
    pub config: RaftConfig,
}

/// Instructs the chosen replacement follower to start an election
/// immediately. Carries the latest AppendEntries payload so the follower can
/// catch up its tail before campaigning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNow {
    pub append_entries_req: AppendEntriesRequest,
}

/// Union of everything a replica's mailbox can receive from peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcMessage {
    AppendEntriesRequest(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    RequestVoteRequest(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    InstallSnapshot(InstallSnapshot),
    TimeoutNow(TimeoutNow),
    /// The removed peer's membership entry committed; the recipient may stop
    RemoveFollowerCompleted,
}

impl RpcMessage {
    /// Term carried by the message, if the variant has one
    pub fn term(&self) -> Option<TermNumber> {
        match self {
            RpcMessage::AppendEntriesRequest(req) => Some(req.term),
            RpcMessage::AppendEntriesResponse(resp) => Some(resp.term),
            RpcMessage::RequestVoteRequest(req) => Some(req.term),
            RpcMessage::RequestVoteResponse(resp) => Some(resp.term),
            RpcMessage::InstallSnapshot(snapshot) => Some(snapshot.term),
            RpcMessage::TimeoutNow(timeout_now) => Some(timeout_now.append_entries_req.term),
            RpcMessage::RemoveFollowerCompleted => None,
        }
    }
}
