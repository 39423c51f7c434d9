//! The per-replica server: role state machine, client facade, start modes
//!
//! Each replica is a single cooperative state machine: one `tokio::select!`
//! loop consumes peer messages, client requests, and timer deadlines one at
//! a time. No handler suspends midway, so no state is ever observed
//! half-mutated.

use std::collections::BTreeSet;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::comm::inmemory::ReplyRouter;
use crate::comm::Comm;
use crate::data_ops::DataOps;
use crate::hook::LeaderHook;

use super::command_results::CommandResults;
use super::config::RaftConfig;
use super::election::Election;
use super::leadership::Leadership;
use super::log_entry::{ClientRef, CommandId, EntryPayload, LogEntry, LogIndex, NodeId, TermNumber};
use super::logs::{AppendEntriesPrep, Logs};
use super::members::{Members, MembersError};
use super::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshot, RequestVoteRequest,
    RequestVoteResponse, RpcMessage, TimeoutNow,
};

/// Errors returned to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// This replica is not the leader; retry at the named one if known
    NotLeader { leader: Option<NodeId> },
    /// Removal rejected: a responsive majority would not remain
    WillBreakQuorum,
    /// The chosen replacement leader has not responded recently
    NewLeaderUnresponsive,
    /// Another membership change is still in flight
    UncommittedMembershipChange,
    /// The named peer is not a follower of this group
    UnknownFollower,
    /// No reachable replica (closed handle, or join list exhausted)
    NoProcess,
    /// The user data rejected the command or query
    CommandFailed(String),
}

/// Reply value delivered back to a waiting client
pub type ClientReply = Result<String, ClientError>;

/// Role of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftState {
    Follower,
    Candidate,
    Leader,
}

/// Snapshot of a replica's externally visible state
#[derive(Debug, Clone)]
pub struct Status {
    pub from: NodeId,
    pub members: BTreeSet<NodeId>,
    pub leader: Option<NodeId>,
    pub unresponsive_followers: Vec<NodeId>,
    pub current_term: TermNumber,
    pub state_name: RaftState,
    pub config: RaftConfig,
    pub commit_index: LogIndex,
    pub log_length: LogIndex,
}

/// Client requests sent to the server loop
enum ClientRequest {
    Command {
        arg: String,
        id: CommandId,
        client: ClientRef,
    },
    Query {
        arg: String,
        client: ClientRef,
    },
    ChangeConfig {
        config: RaftConfig,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    AddFollower {
        follower: NodeId,
        reply: oneshot::Sender<Result<InstallSnapshot, ClientError>>,
    },
    RemoveFollower {
        follower: NodeId,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    ReplaceLeader {
        new_leader: Option<NodeId>,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Status {
        reply: oneshot::Sender<Status>,
    },
}

/// Handle for interacting with a running replica
#[derive(Clone)]
pub struct RaftHandle {
    pub node_id: NodeId,
    request_tx: mpsc::Sender<ClientRequest>,
    shutdown_tx: mpsc::Sender<()>,
    router: Arc<ReplyRouter>,
}

impl RaftHandle {
    /// Submit a state-changing command. The reply arrives once the entry
    /// commits; retries with the same `id` are applied at most once.
    pub async fn command(&self, arg: &str, id: CommandId) -> Result<String, ClientError> {
        let (client, reply_rx) = self.router.register(self.node_id);
        self.request_tx
            .send(ClientRequest::Command {
                arg: arg.to_string(),
                id,
                client,
            })
            .await
            .map_err(|_| ClientError::NoProcess)?;
        reply_rx.await.map_err(|_| ClientError::NoProcess)?
    }

    /// Submit a read-only query. Answered locally while the leader lease
    /// holds, otherwise through the log.
    pub async fn query(&self, arg: &str) -> Result<String, ClientError> {
        let (client, reply_rx) = self.router.register(self.node_id);
        self.request_tx
            .send(ClientRequest::Query {
                arg: arg.to_string(),
                client,
            })
            .await
            .map_err(|_| ClientError::NoProcess)?;
        reply_rx.await.map_err(|_| ClientError::NoProcess)?
    }

    /// Replace the group's tunable configuration (applied on commit)
    pub async fn change_config(&self, config: RaftConfig) -> Result<(), ClientError> {
        self.request(|reply| ClientRequest::ChangeConfig { config, reply })
            .await?
    }

    /// Add a follower; on success returns the InstallSnapshot it must boot
    /// from.
    pub async fn add_follower(&self, follower: NodeId) -> Result<InstallSnapshot, ClientError> {
        self.request(|reply| ClientRequest::AddFollower { follower, reply })
            .await?
    }

    /// Remove a follower from the group
    pub async fn remove_follower(&self, follower: NodeId) -> Result<(), ClientError> {
        self.request(|reply| ClientRequest::RemoveFollower { follower, reply })
            .await?
    }

    /// Designate a follower to take over leadership (`None` cancels)
    pub async fn replace_leader(&self, new_leader: Option<NodeId>) -> Result<(), ClientError> {
        self.request(|reply| ClientRequest::ReplaceLeader { new_leader, reply })
            .await?
    }

    /// Report the replica's externally visible state
    pub async fn status(&self) -> Result<Status, ClientError> {
        self.request(|reply| ClientRequest::Status { reply }).await
    }

    /// Stop the replica's run loop
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ClientRequest,
    ) -> Result<T, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| ClientError::NoProcess)?;
        reply_rx.await.map_err(|_| ClientError::NoProcess)
    }
}

/// A consensus group replica
pub struct RaftServer {
    id: NodeId,
    config: RaftConfig,
    state: RaftState,
    current_term: TermNumber,
    logs: Logs,
    members: Members,
    election: Election,
    /// Present only while leading
    leadership: Option<Leadership>,
    data: Box<dyn DataOps>,
    command_results: CommandResults,
    comm: Box<dyn Comm>,
    hook: Box<dyn LeaderHook>,
    rpc_rx: mpsc::Receiver<RpcMessage>,
    request_rx: mpsc::Receiver<ClientRequest>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Boot a brand-new single-member consensus group with this replica as its
/// leader at term 0. Returns the handle for client interaction.
pub fn create_new_consensus_group(
    id: NodeId,
    config: RaftConfig,
    data: Box<dyn DataOps>,
    hook: Box<dyn LeaderHook>,
    comm: Box<dyn Comm>,
    rpc_rx: mpsc::Receiver<RpcMessage>,
    router: Arc<ReplyRouter>,
) -> Result<RaftHandle, String> {
    config.validate()?;

    let members = Members::new_for_lonely_leader(id);
    let logs = Logs::new_for_lonely_leader(id);
    let election = Election::new_for_leader(&config);
    let leadership = Leadership::new_for_leader(&members, id, &config);

    let mut hook = hook;
    hook.on_elected();

    let (request_tx, request_rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let server = RaftServer {
        id,
        config,
        state: RaftState::Leader,
        current_term: 0,
        logs,
        members,
        election,
        leadership: Some(leadership),
        data,
        command_results: CommandResults::new(),
        comm,
        hook,
        rpc_rx,
        request_rx,
        shutdown_rx,
    };

    info!(node = id, "booted new consensus group");
    tokio::spawn(server.run());

    Ok(RaftHandle {
        node_id: id,
        request_tx,
        shutdown_tx,
        router,
    })
}

/// Join an existing consensus group by asking its peers to add this replica.
///
/// Peers are tried in order; a `{not_leader, leader}` redirect moves the
/// named leader to the front of the remaining list, an unreachable peer is
/// skipped, and an exhausted list fails with `NoProcess`. On success the
/// replica is built from the returned `InstallSnapshot` and spawned as a
/// follower.
pub async fn join_existing_consensus_group(
    id: NodeId,
    data: Box<dyn DataOps>,
    hook: Box<dyn LeaderHook>,
    comm: Box<dyn Comm>,
    rpc_rx: mpsc::Receiver<RpcMessage>,
    router: Arc<ReplyRouter>,
    peers: &[RaftHandle],
) -> Result<RaftHandle, ClientError> {
    let mut remaining: Vec<RaftHandle> = peers.to_vec();

    while !remaining.is_empty() {
        let peer = remaining.remove(0);
        match peer.add_follower(id).await {
            Ok(snapshot) => {
                return spawn_from_snapshot(id, snapshot, data, hook, comm, rpc_rx, router);
            }
            Err(ClientError::NotLeader { leader: Some(l) }) => {
                debug!(node = id, tried = peer.node_id, leader = l, "redirected to leader");
                if let Some(pos) = remaining.iter().position(|h| h.node_id == l) {
                    let leader_handle = remaining.remove(pos);
                    remaining.insert(0, leader_handle);
                }
            }
            Err(err) => {
                debug!(node = id, tried = peer.node_id, ?err, "join attempt failed");
            }
        }
    }

    Err(ClientError::NoProcess)
}

fn spawn_from_snapshot(
    id: NodeId,
    snapshot: InstallSnapshot,
    mut data: Box<dyn DataOps>,
    hook: Box<dyn LeaderHook>,
    comm: Box<dyn Comm>,
    rpc_rx: mpsc::Receiver<RpcMessage>,
    router: Arc<ReplyRouter>,
) -> Result<RaftHandle, ClientError> {
    data.restore(&snapshot.data)
        .map_err(ClientError::CommandFailed)?;

    let config = snapshot.config;
    let mut election = Election::new_for_follower(&config);
    election.leader_message_received();

    let (request_tx, request_rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let server = RaftServer {
        id,
        config,
        state: RaftState::Follower,
        current_term: snapshot.term,
        logs: Logs::new_from_snapshot(snapshot.last_committed_entry),
        members: snapshot.members,
        election,
        leadership: None,
        data,
        command_results: snapshot.command_results,
        comm,
        hook,
        rpc_rx,
        request_rx,
        shutdown_rx,
    };

    info!(node = id, term = server.current_term, "joined consensus group");
    tokio::spawn(server.run());

    Ok(RaftHandle {
        node_id: id,
        request_tx,
        shutdown_tx,
        router,
    })
}

impl RaftServer {
    /// Main server loop: one input at a time, no suspension mid-handler
    async fn run(mut self) {
        loop {
            let is_leader = self.state == RaftState::Leader;
            let election_deadline = self.election.timer_deadline;
            let heartbeat_deadline = self
                .leadership
                .as_ref()
                .map(|l| l.heartbeat_deadline)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            let election_sleep = pin!(sleep_until(election_deadline));
            let heartbeat_sleep = pin!(sleep_until(heartbeat_deadline));

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!(node = self.id, "shutting down");
                    break;
                }
                Some(msg) = self.rpc_rx.recv() => {
                    if !self.handle_rpc(msg).await {
                        break;
                    }
                }
                Some(req) = self.request_rx.recv() => {
                    self.handle_client_request(req).await;
                }
                _ = election_sleep, if !is_leader => {
                    self.become_candidate(false).await;
                }
                _ = heartbeat_sleep, if is_leader => {
                    self.handle_heartbeat_timeout().await;
                }
                else => break,
            }
        }
    }

    // === Role transitions ===

    /// Universal step-down on observing a higher term. A replica that is
    /// already a follower only adopts the term; its election timer and
    /// leader timestamp are untouched, so the vote-guard lease survives
    /// disruptive higher-term candidates.
    fn step_down_to_term(&mut self, term: TermNumber) {
        self.current_term = term;
        self.election.voted_for = None;
        if self.state != RaftState::Follower {
            info!(node = self.id, new_term = term, "stepping down to follower");
            self.state = RaftState::Follower;
            self.leadership = None;
            self.election.update_for_follower(&self.config);
        }
    }

    /// Step down without a term change (lost quorum, or handed leadership off)
    fn step_down_keep_term(&mut self) {
        self.state = RaftState::Follower;
        self.leadership = None;
        self.election.update_for_follower(&self.config);
    }

    async fn become_candidate(&mut self, replacing_leader: bool) {
        self.current_term += 1;
        self.state = RaftState::Candidate;
        self.leadership = None;
        self.members.put_leader(None);
        self.election.update_for_candidate(self.id, &self.config);
        info!(node = self.id, term = self.current_term, replacing_leader, "became candidate");

        if self.election.has_majority(&self.members) {
            // Single-member group: the self vote is already a majority
            self.become_leader().await;
            return;
        }

        let req = RequestVoteRequest {
            term: self.current_term,
            candidate: self.id,
            last_log: (self.logs.last_term(), self.logs.last_index()),
            replacing_leader,
        };
        let sends = self
            .members
            .other_members_list(self.id)
            .into_iter()
            .map(|peer| {
                self.comm
                    .send_event(peer, RpcMessage::RequestVoteRequest(req.clone()))
            });
        futures::future::join_all(sends).await;
    }

    async fn become_leader(&mut self) {
        info!(node = self.id, term = self.current_term, "became leader");
        self.state = RaftState::Leader;
        self.members.put_leader(Some(self.id));
        self.logs.elected_leader(&self.members, self.id, self.current_term);
        self.leadership = Some(Leadership::new_for_leader(&self.members, self.id, &self.config));
        self.replicate_or_commit().await;
    }

    // === Timers ===

    async fn handle_heartbeat_timeout(&mut self) {
        if self.state != RaftState::Leader {
            // Stale deadline delivered across a role change; ignore
            return;
        }

        if self.members.other_members_list(self.id).is_empty() {
            let applicable = self.logs.commit_to_latest(&self.config);
            self.apply_entries(applicable).await;
            if let Some(leadership) = &mut self.leadership {
                leadership.refresh_quorum(&self.members, self.id, &self.config);
            }
        } else {
            let quorum_lost = self
                .leadership
                .as_ref()
                .map(|l| l.minimum_timeout_elapsed_since_quorum_responded(&self.config))
                .unwrap_or(true);
            if quorum_lost {
                info!(node = self.id, term = self.current_term,
                      "cannot reach quorum, stepping down");
                self.step_down_keep_term();
                self.members.put_leader(None);
                return;
            }
            self.broadcast_append_entries().await;
        }

        if let Some(leadership) = &mut self.leadership {
            leadership.reset_heartbeat_timer(&self.config);
        }
    }

    // === Peer messages ===

    /// Returns false when the replica should terminate
    async fn handle_rpc(&mut self, msg: RpcMessage) -> bool {
        if let Some(term) = msg.term() {
            if term > self.current_term {
                self.step_down_to_term(term);
            }
        }

        match msg {
            RpcMessage::AppendEntriesRequest(req) => {
                self.handle_append_entries_request(req).await;
            }
            RpcMessage::AppendEntriesResponse(resp) => {
                self.handle_append_entries_response(resp).await;
            }
            RpcMessage::RequestVoteRequest(req) => {
                self.handle_request_vote_request(req).await;
            }
            RpcMessage::RequestVoteResponse(resp) => {
                self.handle_request_vote_response(resp).await;
            }
            RpcMessage::InstallSnapshot(snapshot) => {
                self.handle_install_snapshot(snapshot);
            }
            RpcMessage::TimeoutNow(timeout_now) => {
                self.handle_timeout_now(timeout_now).await;
            }
            RpcMessage::RemoveFollowerCompleted => {
                info!(node = self.id, "removed from consensus group, terminating");
                return false;
            }
        }
        true
    }

    async fn handle_append_entries_request(&mut self, req: AppendEntriesRequest) {
        if req.term < self.current_term {
            self.send(
                req.leader,
                RpcMessage::AppendEntriesResponse(AppendEntriesResponse {
                    from: self.id,
                    term: self.current_term,
                    success: false,
                    i_replicated: None,
                }),
            )
            .await;
            return;
        }

        // Same-term AppendEntries: the sender is the legitimate leader
        if self.state != RaftState::Follower {
            self.step_down_keep_term();
        }
        self.members.put_leader(Some(req.leader));
        self.election.leader_message_received();
        self.election.reset_timer(&self.config);

        if !self.logs.contain_given_prev_log(req.prev_log_term, req.prev_log_index) {
            debug!(node = self.id, prev_index = req.prev_log_index,
                   "rejecting AppendEntries: prev log mismatch");
            self.send(
                req.leader,
                RpcMessage::AppendEntriesResponse(AppendEntriesResponse {
                    from: self.id,
                    term: self.current_term,
                    success: false,
                    i_replicated: None,
                }),
            )
            .await;
            return;
        }

        let applicable = self.logs.append_entries(
            &mut self.members,
            &req.entries,
            req.i_leader_commit,
            &self.config,
        );
        self.apply_entries(applicable).await;

        self.send(
            req.leader,
            RpcMessage::AppendEntriesResponse(AppendEntriesResponse {
                from: self.id,
                term: self.current_term,
                success: true,
                i_replicated: Some(self.logs.last_index()),
            }),
        )
        .await;
    }

    async fn handle_append_entries_response(&mut self, resp: AppendEntriesResponse) {
        if self.state != RaftState::Leader || resp.term < self.current_term {
            return;
        }

        if !resp.success {
            self.logs.decrement_next_index_of_follower(resp.from);
            self.send_append_entries_to(resp.from).await;
            return;
        }

        if let Some(leadership) = &mut self.leadership {
            leadership.follower_responded(&self.members, self.id, resp.from, &self.config);
        }
        let i_replicated = resp.i_replicated.unwrap_or(0);
        let applicable = self.logs.set_follower_index(
            &self.members,
            self.id,
            self.current_term,
            resp.from,
            i_replicated,
            &self.config,
        );
        self.apply_entries(applicable).await;

        // Cooperative leader replacement: once the chosen follower has our
        // whole log, tell it to campaign and step aside.
        if self.state == RaftState::Leader
            && self.members.pending_leader_change == Some(resp.from)
            && self.logs.match_index_of(resp.from) == Some(self.logs.last_index())
        {
            if let AppendEntriesPrep::Request(req) =
                self.logs
                    .make_append_entries_req(self.id, self.current_term, resp.from)
            {
                info!(node = self.id, new_leader = resp.from, "handing leadership off");
                self.send(
                    resp.from,
                    RpcMessage::TimeoutNow(TimeoutNow {
                        append_entries_req: req,
                    }),
                )
                .await;
                let _ = self.members.start_replacing_leader(None);
                self.members.put_leader(None);
                self.step_down_keep_term();
            }
        }
    }

    async fn handle_request_vote_request(&mut self, req: RequestVoteRequest) {
        let authority_lapsed = match (&self.state, &self.leadership) {
            (RaftState::Leader, Some(leadership)) => {
                leadership.minimum_timeout_elapsed_since_quorum_responded(&self.config)
            }
            _ => self
                .election
                .minimum_timeout_elapsed_since_last_leader_message(&self.config),
        };

        let grant = req.term == self.current_term
            && (self.election.voted_for.is_none()
                || self.election.voted_for == Some(req.candidate))
            && self.logs.candidate_log_up_to_date(req.last_log)
            && (req.replacing_leader || authority_lapsed);

        if grant {
            debug!(node = self.id, candidate = req.candidate, term = req.term, "granting vote");
            self.election.vote_for(req.candidate, &self.config);
        }

        self.send(
            req.candidate,
            RpcMessage::RequestVoteResponse(RequestVoteResponse {
                from: self.id,
                term: self.current_term,
                vote_granted: grant,
            }),
        )
        .await;
    }

    async fn handle_request_vote_response(&mut self, resp: RequestVoteResponse) {
        if self.state != RaftState::Candidate
            || resp.term != self.current_term
            || !resp.vote_granted
        {
            return;
        }
        if self.election.gain_vote(&self.members, resp.from) {
            self.become_leader().await;
        }
    }

    fn handle_install_snapshot(&mut self, snapshot: InstallSnapshot) {
        if snapshot.term < self.current_term {
            return;
        }
        if snapshot.last_committed_entry.index <= self.logs.i_committed() {
            return;
        }
        // Restore the user data first so a malformed snapshot is dropped
        // before any replica state changes
        if let Err(err) = self.data.restore(&snapshot.data) {
            warn!(node = self.id, error = %err, "dropping unusable snapshot");
            return;
        }

        info!(node = self.id, term = snapshot.term,
              index = snapshot.last_committed_entry.index, "installing snapshot");
        self.current_term = snapshot.term;
        self.state = RaftState::Follower;
        self.leadership = None;
        self.logs = Logs::new_from_snapshot(snapshot.last_committed_entry);
        self.members = snapshot.members;
        self.command_results = snapshot.command_results;
        self.config = snapshot.config;
        self.election.update_for_follower(&self.config);
        self.election.leader_message_received();
    }

    async fn handle_timeout_now(&mut self, timeout_now: TimeoutNow) {
        let req = timeout_now.append_entries_req;
        if req.term < self.current_term {
            return;
        }
        if !self.logs.contain_given_prev_log(req.prev_log_term, req.prev_log_index) {
            debug!(node = self.id, "ignoring TimeoutNow: log tail does not match");
            return;
        }

        // Catch up with the piggybacked entries, then campaign immediately;
        // replacing_leader makes peers grant votes inside their leases
        let applicable = self.logs.append_entries(
            &mut self.members,
            &req.entries,
            req.i_leader_commit,
            &self.config,
        );
        self.apply_entries(applicable).await;
        self.become_candidate(true).await;
    }

    // === Client requests ===

    async fn handle_client_request(&mut self, req: ClientRequest) {
        match req {
            ClientRequest::Command { arg, id, client } => {
                if self.state != RaftState::Leader {
                    self.comm
                        .reply(client, Err(self.not_leader_error()))
                        .await;
                    return;
                }
                self.logs
                    .add_entry(self.current_term, EntryPayload::Command { client, arg, id });
                self.replicate_or_commit().await;
            }
            ClientRequest::Query { arg, client } => {
                if self.state != RaftState::Leader {
                    self.comm
                        .reply(client, Err(self.not_leader_error()))
                        .await;
                    return;
                }
                let lease_valid = self
                    .leadership
                    .as_ref()
                    .map(|l| !l.minimum_timeout_elapsed_since_quorum_responded(&self.config))
                    .unwrap_or(false);
                if lease_valid {
                    // Fast path: answer from the applied data without a log
                    // entry
                    let result = self
                        .data
                        .query(&arg)
                        .map_err(ClientError::CommandFailed);
                    self.comm.reply(client, result).await;
                    self.hook.on_query_answered(&arg);
                } else {
                    self.logs
                        .add_entry(self.current_term, EntryPayload::Query { client, arg });
                    self.replicate_or_commit().await;
                }
            }
            ClientRequest::ChangeConfig { config, reply } => {
                let _ = reply.send(self.handle_change_config(config).await);
            }
            ClientRequest::AddFollower { follower, reply } => {
                let _ = reply.send(self.handle_add_follower(follower).await);
            }
            ClientRequest::RemoveFollower { follower, reply } => {
                let _ = reply.send(self.handle_remove_follower(follower).await);
            }
            ClientRequest::ReplaceLeader { new_leader, reply } => {
                let _ = reply.send(self.handle_replace_leader(new_leader).await);
            }
            ClientRequest::Status { reply } => {
                let _ = reply.send(self.build_status());
            }
        }
    }

    async fn handle_change_config(&mut self, config: RaftConfig) -> Result<(), ClientError> {
        if self.state != RaftState::Leader {
            return Err(self.not_leader_error());
        }
        config.validate().map_err(ClientError::CommandFailed)?;
        self.logs
            .add_entry(self.current_term, EntryPayload::ChangeConfig { config });
        self.replicate_or_commit().await;
        Ok(())
    }

    async fn handle_add_follower(&mut self, follower: NodeId) -> Result<InstallSnapshot, ClientError> {
        if self.state != RaftState::Leader {
            return Err(self.not_leader_error());
        }
        if self.members.uncommitted_membership_change.is_some() {
            return Err(ClientError::UncommittedMembershipChange);
        }
        if self.members.contains(follower) {
            return Err(ClientError::UnknownFollower);
        }
        let data = self
            .data
            .snapshot()
            .map_err(ClientError::CommandFailed)?;

        let entry = self
            .logs
            .prepare_to_add_follower(&self.members, self.current_term, follower)
            .map_err(members_error)?;
        self.members
            .start_adding_follower(entry)
            .map_err(members_error)?;
        if let Some(leadership) = &mut self.leadership {
            leadership.follower_added(follower);
        }
        info!(node = self.id, follower, "adding follower");

        let snapshot = InstallSnapshot {
            members: self.members.clone(),
            term: self.current_term,
            last_committed_entry: self.logs.last_committed_entry().clone(),
            data,
            command_results: self.command_results.clone(),
            config: self.config.clone(),
        };
        self.replicate_or_commit().await;
        Ok(snapshot)
    }

    async fn handle_remove_follower(&mut self, follower: NodeId) -> Result<(), ClientError> {
        if self.state != RaftState::Leader {
            return Err(self.not_leader_error());
        }
        if follower == self.id {
            // A leader never removes itself; hand leadership off first
            return Err(ClientError::WillBreakQuorum);
        }
        if !self.members.contains(follower) {
            return Err(ClientError::UnknownFollower);
        }
        if self.members.uncommitted_membership_change.is_some() {
            return Err(ClientError::UncommittedMembershipChange);
        }
        let safe = self
            .leadership
            .as_ref()
            .map(|l| l.can_safely_remove(&self.members, self.id, follower, &self.config))
            .unwrap_or(false);
        if !safe {
            return Err(ClientError::WillBreakQuorum);
        }

        let entry = self
            .logs
            .prepare_to_remove_follower(&self.members, self.current_term, follower)
            .map_err(members_error)?;
        self.members
            .start_removing_follower(entry)
            .map_err(members_error)?;
        if let Some(leadership) = &mut self.leadership {
            leadership.remove_follower_response_time_entry(follower);
        }
        info!(node = self.id, follower, "removing follower");
        self.replicate_or_commit().await;
        Ok(())
    }

    async fn handle_replace_leader(&mut self, new_leader: Option<NodeId>) -> Result<(), ClientError> {
        if self.state != RaftState::Leader {
            return Err(self.not_leader_error());
        }
        if let Some(target) = new_leader {
            if target == self.id || !self.members.contains(target) {
                return Err(ClientError::UnknownFollower);
            }
            let unresponsive = self
                .leadership
                .as_ref()
                .map(|l| l.unresponsive_followers(&self.members, self.id, &self.config))
                .unwrap_or_default();
            if unresponsive.contains(&target) {
                return Err(ClientError::NewLeaderUnresponsive);
            }
        }
        self.members
            .start_replacing_leader(new_leader)
            .map_err(members_error)?;
        if new_leader.is_some() {
            info!(node = self.id, target = ?new_leader, "leader replacement pending");
            // The handoff completes when the target next acknowledges a
            // fully caught-up log; nudge it along now
            self.broadcast_append_entries().await;
        }
        Ok(())
    }

    fn build_status(&self) -> Status {
        let unresponsive_followers = self
            .leadership
            .as_ref()
            .map(|l| l.unresponsive_followers(&self.members, self.id, &self.config))
            .unwrap_or_default();
        Status {
            from: self.id,
            members: self.members.all_members().clone(),
            leader: self.members.leader,
            unresponsive_followers,
            current_term: self.current_term,
            state_name: self.state,
            config: self.config.clone(),
            commit_index: self.logs.i_committed(),
            log_length: self.logs.last_index(),
        }
    }

    fn not_leader_error(&self) -> ClientError {
        ClientError::NotLeader {
            leader: self.members.leader,
        }
    }

    // === Replication ===

    /// After a leader-side append: lonely leaders commit immediately,
    /// otherwise replicate to the group.
    async fn replicate_or_commit(&mut self) {
        if self.members.other_members_list(self.id).is_empty() {
            let applicable = self.logs.commit_to_latest(&self.config);
            self.apply_entries(applicable).await;
        } else {
            self.broadcast_append_entries().await;
        }
    }

    async fn broadcast_append_entries(&mut self) {
        let peers = self.members.other_members_list(self.id);
        let mut sends = Vec::with_capacity(peers.len());
        for peer in peers {
            match self
                .logs
                .make_append_entries_req(self.id, self.current_term, peer)
            {
                AppendEntriesPrep::Request(req) => {
                    sends.push((peer, RpcMessage::AppendEntriesRequest(req)));
                }
                AppendEntriesPrep::SnapshotNeeded => {
                    if let Some(snapshot) = self.build_install_snapshot() {
                        debug!(node = self.id, peer, "follower too far behind, sending snapshot");
                        sends.push((peer, RpcMessage::InstallSnapshot(snapshot)));
                    }
                }
                AppendEntriesPrep::UnknownFollower => {}
            }
        }
        let sends = sends
            .into_iter()
            .map(|(peer, msg)| self.comm.send_event(peer, msg));
        futures::future::join_all(sends).await;
    }

    async fn send_append_entries_to(&mut self, peer: NodeId) {
        match self
            .logs
            .make_append_entries_req(self.id, self.current_term, peer)
        {
            AppendEntriesPrep::Request(req) => {
                self.send(peer, RpcMessage::AppendEntriesRequest(req)).await;
            }
            AppendEntriesPrep::SnapshotNeeded => {
                if let Some(snapshot) = self.build_install_snapshot() {
                    self.send(peer, RpcMessage::InstallSnapshot(snapshot)).await;
                }
            }
            AppendEntriesPrep::UnknownFollower => {}
        }
    }

    fn build_install_snapshot(&self) -> Option<InstallSnapshot> {
        let data = match self.data.snapshot() {
            Ok(data) => data,
            Err(err) => {
                warn!(node = self.id, error = %err, "user data refused to snapshot");
                return None;
            }
        };
        Some(InstallSnapshot {
            members: self.members.clone(),
            term: self.current_term,
            last_committed_entry: self.logs.last_committed_entry().clone(),
            data,
            command_results: self.command_results.clone(),
            config: self.config.clone(),
        })
    }

    async fn send(&self, dest: NodeId, msg: RpcMessage) {
        self.comm.send_event(dest, msg).await;
    }

    // === Applying committed entries ===

    async fn apply_entries(&mut self, entries: Vec<LogEntry>) {
        for entry in entries {
            self.apply_one(entry).await;
        }
    }

    async fn apply_one(&mut self, entry: LogEntry) {
        let is_leader = self.state == RaftState::Leader;
        match entry.payload {
            EntryPayload::Command { client, arg, id } => {
                match self.command_results.fetch(id).cloned() {
                    Some(cached) => {
                        // Retried command: reply from the cache, never
                        // re-execute
                        if is_leader {
                            let reply = cached.map_err(ClientError::CommandFailed);
                            self.comm.reply(client, reply).await;
                        }
                    }
                    None => {
                        let result = self.data.command(&arg);
                        self.command_results.put(
                            id,
                            result.clone(),
                            self.config.max_retained_command_results,
                        );
                        if is_leader {
                            self.hook.on_command_committed(id, &arg, &result);
                            let reply = result.map_err(ClientError::CommandFailed);
                            self.comm.reply(client, reply).await;
                        }
                    }
                }
            }
            EntryPayload::Query { client, arg } => {
                // Only reached when the lease fast path was unavailable at
                // append time; non-leaders stay silent
                if is_leader {
                    let result = self.data.query(&arg).map_err(ClientError::CommandFailed);
                    self.comm.reply(client, result).await;
                    self.hook.on_query_answered(&arg);
                }
            }
            EntryPayload::ChangeConfig { config } => {
                info!(node = self.id, "applying new configuration");
                self.config = config;
            }
            EntryPayload::LeaderElected { leader } => {
                if is_leader && leader == self.id {
                    self.hook.on_elected();
                }
            }
            EntryPayload::AddFollower { follower } => {
                self.members.membership_change_committed(entry.index);
                if is_leader {
                    info!(node = self.id, follower, "follower addition committed");
                    self.hook.on_follower_added(follower);
                }
            }
            EntryPayload::RemoveFollower { follower } => {
                self.members.membership_change_committed(entry.index);
                self.logs.remove_follower_indices(follower);
                if let Some(leadership) = &mut self.leadership {
                    leadership.remove_follower_response_time_entry(follower);
                }
                if is_leader {
                    info!(node = self.id, follower, "follower removal committed");
                    self.hook.on_follower_removed(follower);
                    self.send(follower, RpcMessage::RemoveFollowerCompleted).await;
                }
            }
        }
    }
}

fn members_error(err: MembersError) -> ClientError {
    match err {
        MembersError::UncommittedMembershipChange => ClientError::UncommittedMembershipChange,
        MembersError::UnknownFollower => ClientError::UnknownFollower,
    }
}
