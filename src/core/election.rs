//! Per-term vote state and the election timer

use std::collections::HashSet;

use tokio::time::Instant;

use super::config::RaftConfig;
use super::members::Members;
use super::log_entry::NodeId;

/// Vote bookkeeping for the current term plus the election timer deadline.
///
/// The timer is a deadline polled by the server loop; rearming overwrites
/// the deadline, which cancels the pending fire.
#[derive(Debug, Clone)]
pub struct Election {
    /// Candidate granted this replica's vote in the current term
    pub voted_for: Option<NodeId>,
    /// Peers that granted us a vote (candidate only; self pre-counted)
    votes_granted: HashSet<NodeId>,
    /// When the election timer fires
    pub timer_deadline: Instant,
    /// Last time a legitimate leader was heard from (follower/candidate only)
    last_leader_message: Option<Instant>,
}

impl Election {
    /// Election state for a replica that is already leader; the timer is
    /// armed but the server loop ignores it while leading.
    pub fn new_for_leader(config: &RaftConfig) -> Self {
        Election {
            voted_for: None,
            votes_granted: HashSet::new(),
            timer_deadline: Instant::now() + config.election_timeout,
            last_leader_message: None,
        }
    }

    /// Fresh follower state with a randomized election timer running
    pub fn new_for_follower(config: &RaftConfig) -> Self {
        Election {
            voted_for: None,
            votes_granted: HashSet::new(),
            timer_deadline: Instant::now() + config.random_election_timeout(),
            last_leader_message: None,
        }
    }

    /// Transition into a new candidacy: clear the old vote, vote for self,
    /// and rearm the timer with a fresh randomized duration.
    pub fn update_for_candidate(&mut self, me: NodeId, config: &RaftConfig) {
        self.voted_for = Some(me);
        self.votes_granted.clear();
        self.votes_granted.insert(me);
        self.timer_deadline = Instant::now() + config.random_election_timeout();
    }

    /// Transition back to follower: forget the leader timestamp and restart
    /// the timer.
    pub fn update_for_follower(&mut self, config: &RaftConfig) {
        self.votes_granted.clear();
        self.last_leader_message = None;
        self.timer_deadline = Instant::now() + config.random_election_timeout();
    }

    /// Grant our vote to `candidate` and rearm the timer
    pub fn vote_for(&mut self, candidate: NodeId, config: &RaftConfig) {
        self.voted_for = Some(candidate);
        self.timer_deadline = Instant::now() + config.random_election_timeout();
    }

    /// Record a granted vote from `from`; returns true once the votes form a
    /// majority of the voting membership.
    pub fn gain_vote(&mut self, members: &Members, from: NodeId) -> bool {
        self.votes_granted.insert(from);
        self.has_majority(members)
    }

    /// Do the votes gathered so far form a majority?
    pub fn has_majority(&self, members: &Members) -> bool {
        let granted = self
            .votes_granted
            .iter()
            .filter(|v| members.contains(**v))
            .count();
        granted > members.voter_count() / 2
    }

    /// Rearm the election timer (any valid message from the current leader)
    pub fn reset_timer(&mut self, config: &RaftConfig) {
        self.timer_deadline = Instant::now() + config.random_election_timeout();
    }

    /// Note that a legitimate leader was just heard from
    pub fn leader_message_received(&mut self) {
        self.last_leader_message = Some(Instant::now());
    }

    /// True iff at least `election_timeout` has passed since the last
    /// message from a legitimate leader. Used to deny RequestVote while the
    /// current leader's lease is still plausible.
    pub fn minimum_timeout_elapsed_since_last_leader_message(&self, config: &RaftConfig) -> bool {
        match self.last_leader_message {
            Some(at) => Instant::now().duration_since(at) >= config.election_timeout,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log_entry::EntryPayload;
    use crate::core::log_entry::LogEntry;

    fn three_members() -> Members {
        let mut members = Members::new_for_lonely_leader(1);
        for (index, follower) in [(2u64, 2u64), (3, 3)] {
            members
                .start_adding_follower(LogEntry {
                    term: 1,
                    index,
                    payload: EntryPayload::AddFollower { follower },
                })
                .unwrap();
            members.membership_change_committed(index);
        }
        members
    }

    #[test]
    fn test_candidate_votes_for_self() {
        let config = RaftConfig::default();
        let mut election = Election::new_for_follower(&config);
        election.update_for_candidate(1, &config);

        assert_eq!(election.voted_for, Some(1));
        // Self vote alone is not a majority of three
        assert!(!election.has_majority(&three_members()));
    }

    #[test]
    fn test_majority_of_three_needs_two_votes() {
        let config = RaftConfig::default();
        let members = three_members();
        let mut election = Election::new_for_follower(&config);
        election.update_for_candidate(1, &config);

        assert!(election.gain_vote(&members, 2));
    }

    #[test]
    fn test_duplicate_votes_counted_once() {
        let config = RaftConfig::default();
        let mut members = three_members();
        // Grow to five voters so two distinct grants are not yet a majority
        for (index, follower) in [(10u64, 4u64), (11, 5)] {
            members
                .start_adding_follower(LogEntry {
                    term: 1,
                    index,
                    payload: EntryPayload::AddFollower { follower },
                })
                .unwrap();
            members.membership_change_committed(index);
        }

        let mut election = Election::new_for_follower(&config);
        election.update_for_candidate(1, &config);

        assert!(!election.gain_vote(&members, 2));
        assert!(!election.gain_vote(&members, 2), "retransmitted grant");
        assert!(election.gain_vote(&members, 3), "third distinct voter wins");
    }

    #[test]
    fn test_new_candidacy_resets_granted_votes() {
        let config = RaftConfig::default();
        let members = three_members();
        let mut election = Election::new_for_follower(&config);

        election.update_for_candidate(1, &config);
        assert!(election.gain_vote(&members, 2));

        election.update_for_candidate(1, &config);
        assert!(!election.has_majority(&members), "old votes must not carry over");
    }

    #[test]
    fn test_leader_silence_lifts_vote_guard() {
        let config = RaftConfig::default();
        let mut election = Election::new_for_follower(&config);

        // Never heard from a leader: guard is lifted
        assert!(election.minimum_timeout_elapsed_since_last_leader_message(&config));

        election.leader_message_received();
        assert!(!election.minimum_timeout_elapsed_since_last_leader_message(&config));

        election.update_for_follower(&config);
        assert!(
            election.minimum_timeout_elapsed_since_last_leader_message(&config),
            "step-down clears the leader timestamp"
        );
    }
}
