//! Leader-only state: heartbeat timer, follower responsiveness, quorum lease

use std::collections::HashMap;

use tokio::time::Instant;

use super::config::RaftConfig;
use super::log_entry::NodeId;
use super::members::Members;

/// Heartbeat scheduling and the quorum lease, present only while leading.
///
/// The lease: queries may be answered locally as long as a majority of the
/// voting membership has responded within one `election_timeout` window.
/// Dropping this struct on step-down cancels both timers.
#[derive(Debug, Clone)]
pub struct Leadership {
    /// When the next heartbeat broadcast is due
    pub heartbeat_deadline: Instant,
    /// Last AppendEntries response time per follower
    last_response_time: HashMap<NodeId, Instant>,
    /// Start of the most recent window in which a quorum was heard from
    quorum_responded_at: Instant,
}

impl Leadership {
    /// Fresh leader state. Followers are seeded as just-responded (they just
    /// granted their votes) and the quorum timestamp starts at now.
    pub fn new_for_leader(members: &Members, me: NodeId, config: &RaftConfig) -> Self {
        let now = Instant::now();
        let last_response_time = members
            .other_members_list(me)
            .into_iter()
            .map(|peer| (peer, now))
            .collect();
        Leadership {
            heartbeat_deadline: now + config.heartbeat_timeout,
            last_response_time,
            quorum_responded_at: now,
        }
    }

    /// Record an AppendEntries response from `from` and refresh the lease
    pub fn follower_responded(
        &mut self,
        members: &Members,
        me: NodeId,
        from: NodeId,
        config: &RaftConfig,
    ) {
        self.last_response_time.insert(from, Instant::now());
        self.refresh_quorum(members, me, config);
    }

    /// Recompute the quorum timestamp: the freshest instant at which a
    /// majority of voters (self counts as now) had all responded. Advances
    /// only when that instant lies within one election timeout.
    pub fn refresh_quorum(&mut self, members: &Members, me: NodeId, config: &RaftConfig) {
        let now = Instant::now();
        let mut times: Vec<Instant> = Vec::with_capacity(members.voter_count());
        for member in members.all_members() {
            if *member == me {
                times.push(now);
            } else if let Some(at) = self.last_response_time.get(member) {
                times.push(*at);
            }
        }
        times.sort_unstable_by(|a, b| b.cmp(a));

        let majority = members.voter_count() / 2 + 1;
        if let Some(at) = times.get(majority - 1) {
            if now.duration_since(*at) < config.election_timeout && *at > self.quorum_responded_at {
                self.quorum_responded_at = *at;
            }
        }
    }

    /// True iff the lease has expired: no quorum heard from for at least one
    /// election timeout.
    pub fn minimum_timeout_elapsed_since_quorum_responded(&self, config: &RaftConfig) -> bool {
        Instant::now().duration_since(self.quorum_responded_at) >= config.election_timeout
    }

    /// Rearm the heartbeat timer
    pub fn reset_heartbeat_timer(&mut self, config: &RaftConfig) {
        self.heartbeat_deadline = Instant::now() + config.heartbeat_timeout;
    }

    /// Followers whose last response is older than one election timeout
    pub fn unresponsive_followers(
        &self,
        members: &Members,
        me: NodeId,
        config: &RaftConfig,
    ) -> Vec<NodeId> {
        let now = Instant::now();
        members
            .other_members_list(me)
            .into_iter()
            .filter(|peer| match self.last_response_time.get(peer) {
                Some(at) => now.duration_since(*at) >= config.election_timeout,
                None => true,
            })
            .collect()
    }

    /// Would removing `pid` still leave a responsive majority?
    pub fn can_safely_remove(
        &self,
        members: &Members,
        me: NodeId,
        pid: NodeId,
        config: &RaftConfig,
    ) -> bool {
        let unresponsive = self.unresponsive_followers(members, me, config);
        let responsive_after_removal = members
            .all_members()
            .iter()
            .filter(|&&m| m != pid && !unresponsive.contains(&m))
            .count();
        let voters_after_removal = members.voter_count() - 1;
        responsive_after_removal > voters_after_removal / 2
    }

    /// Seed response bookkeeping for a follower that just joined
    pub fn follower_added(&mut self, pid: NodeId) {
        self.last_response_time.insert(pid, Instant::now());
    }

    /// Drop response bookkeeping for a removed follower
    pub fn remove_follower_response_time_entry(&mut self, pid: NodeId) {
        self.last_response_time.remove(&pid);
    }
}
