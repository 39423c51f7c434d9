//! Replicated log storage: match/append, commit tracking, follower progress

use std::collections::{BTreeMap, HashMap};

use super::config::RaftConfig;
use super::log_entry::{EntryPayload, LogEntry, LogIndex, NodeId, TermNumber};
use super::members::{Members, MembersError};
use super::message::AppendEntriesRequest;

/// Leader-side replication progress for one follower
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowerIndices {
    /// Index of the next entry to send
    pub next_index: LogIndex,
    /// Highest index known to be replicated
    pub match_index: LogIndex,
}

/// Outcome of preparing an AppendEntries request for one follower
#[derive(Debug, Clone)]
pub enum AppendEntriesPrep {
    Request(AppendEntriesRequest),
    /// The follower's next index precedes the retained window; send an
    /// InstallSnapshot instead (next index has been reset past the commit
    /// point)
    SnapshotNeeded,
    /// No progress record: the follower was already removed
    UnknownFollower,
}

/// The replicated log.
///
/// Entries live in an ordered map so the retention window (committed entries
/// kept behind the commit point for lagging followers) is a cheap prefix
/// drop. The entry at the commit point is always retained, so
/// `last_entry`/`last_committed_entry` are total.
#[derive(Debug, Clone)]
pub struct Logs {
    entries: BTreeMap<LogIndex, LogEntry>,
    i_committed: LogIndex,
    followers: HashMap<NodeId, FollowerIndices>,
}

impl Logs {
    /// Log of a freshly booted single-member group: one committed
    /// `leader_elected` entry at index 1, term 0.
    pub fn new_for_lonely_leader(leader: NodeId) -> Self {
        let entry = LogEntry {
            term: 0,
            index: 1,
            payload: EntryPayload::LeaderElected { leader },
        };
        let mut entries = BTreeMap::new();
        entries.insert(entry.index, entry);
        Logs {
            entries,
            i_committed: 1,
            followers: HashMap::new(),
        }
    }

    /// Log reconstructed from an InstallSnapshot: it starts just after the
    /// snapshot's last committed entry.
    pub fn new_from_snapshot(last_committed_entry: LogEntry) -> Self {
        let i_committed = last_committed_entry.index;
        let mut entries = BTreeMap::new();
        entries.insert(last_committed_entry.index, last_committed_entry);
        Logs {
            entries,
            i_committed,
            followers: HashMap::new(),
        }
    }

    /// Newest entry, committed or not
    pub fn last_entry(&self) -> &LogEntry {
        self.entries.values().next_back().expect("log is never empty")
    }

    /// Newest committed entry
    pub fn last_committed_entry(&self) -> &LogEntry {
        self.entries
            .get(&self.i_committed)
            .expect("committed entry is always retained")
    }

    pub fn last_index(&self) -> LogIndex {
        self.last_entry().index
    }

    pub fn last_term(&self) -> TermNumber {
        self.last_entry().term
    }

    pub fn i_committed(&self) -> LogIndex {
        self.i_committed
    }

    fn i_min(&self) -> LogIndex {
        *self.entries.keys().next().expect("log is never empty")
    }

    /// AppendEntries consistency check: true iff `index` is 0 or the log has
    /// an entry at `index` with matching `term`. Indices at or below the
    /// commit point that fell out of the retention window are trusted: a
    /// current leader's log always contains every committed entry.
    pub fn contain_given_prev_log(&self, term: TermNumber, index: LogIndex) -> bool {
        match self.entries.get(&index) {
            Some(entry) => entry.term == term,
            None => index == 0 || index < self.i_min(),
        }
    }

    /// Follower-side truncate-and-append. `entries` must already have passed
    /// the prev-log check. Advances the commit index to
    /// `min(leader_commit, last index)` and returns the newly committed
    /// entries in ascending index order. Truncation that removes an
    /// uncommitted membership-change entry clears it from `members`.
    pub fn append_entries(
        &mut self,
        members: &mut Members,
        entries: &[LogEntry],
        leader_commit: LogIndex,
        config: &RaftConfig,
    ) -> Vec<LogEntry> {
        for entry in entries {
            match self.entries.get(&entry.index) {
                Some(existing) if existing.term == entry.term => {
                    // Already present (retransmission); skip
                }
                Some(_) => {
                    // Conflict: same index, different term. Drop this entry
                    // and everything after it, then append the new one.
                    self.truncate_from(members, entry.index);
                    self.adopt(members, entry);
                    self.entries.insert(entry.index, entry.clone());
                }
                None => {
                    self.adopt(members, entry);
                    self.entries.insert(entry.index, entry.clone());
                }
            }
        }

        let new_commit = leader_commit.min(self.last_index());
        let applicable = self.advance_commit(new_commit);
        self.apply_retention(config);
        applicable
    }

    /// Membership entries take effect as soon as they are in the log; a
    /// joining follower's own add entry is already reflected in its snapshot
    /// membership and is skipped here.
    fn adopt(&self, members: &mut Members, entry: &LogEntry) {
        match &entry.payload {
            EntryPayload::AddFollower { .. } => {
                let _ = members.start_adding_follower(entry.clone());
            }
            EntryPayload::RemoveFollower { .. } => {
                let _ = members.start_removing_follower(entry.clone());
            }
            _ => {}
        }
    }

    fn truncate_from(&mut self, members: &mut Members, index: LogIndex) {
        self.entries.split_off(&index);
        if let Some(change) = &members.uncommitted_membership_change {
            if change.index >= index {
                members.abort_uncommitted_change();
            }
        }
    }

    fn advance_commit(&mut self, new_commit: LogIndex) -> Vec<LogEntry> {
        if new_commit <= self.i_committed {
            return Vec::new();
        }
        let applicable: Vec<LogEntry> = self
            .entries
            .range(self.i_committed + 1..=new_commit)
            .map(|(_, e)| e.clone())
            .collect();
        self.i_committed = new_commit;
        applicable
    }

    fn apply_retention(&mut self, config: &RaftConfig) {
        let cutoff = (self.i_committed + 1).saturating_sub(config.max_retained_committed_logs as u64);
        while let Some((&first, _)) = self.entries.first_key_value() {
            if first >= cutoff {
                break;
            }
            self.entries.remove(&first);
        }
    }

    // === Leader-side operations ===

    /// Append one entry at the next index
    pub fn add_entry(&mut self, term: TermNumber, payload: EntryPayload) -> LogEntry {
        let entry = LogEntry {
            term,
            index: self.last_index() + 1,
            payload,
        };
        self.entries.insert(entry.index, entry.clone());
        entry
    }

    /// Called on winning an election: initialize per-follower progress
    /// (next = last index + 1, so the `leader_elected` entry appended right
    /// after is the first thing sent) and append the `leader_elected` entry.
    pub fn elected_leader(&mut self, members: &Members, me: NodeId, term: TermNumber) -> LogEntry {
        let next_index = self.last_index() + 1;
        self.followers = members
            .other_members_list(me)
            .into_iter()
            .map(|peer| {
                (
                    peer,
                    FollowerIndices {
                        next_index,
                        match_index: 0,
                    },
                )
            })
            .collect();
        self.add_entry(term, EntryPayload::LeaderElected { leader: me })
    }

    /// Append an `add_follower` entry and start tracking the new follower
    /// from the commit point (it bootstraps from an InstallSnapshot).
    /// Fails if another membership change is still uncommitted.
    pub fn prepare_to_add_follower(
        &mut self,
        members: &Members,
        term: TermNumber,
        pid: NodeId,
    ) -> Result<LogEntry, MembersError> {
        if members.uncommitted_membership_change.is_some() {
            return Err(MembersError::UncommittedMembershipChange);
        }
        let entry = self.add_entry(term, EntryPayload::AddFollower { follower: pid });
        self.followers.insert(
            pid,
            FollowerIndices {
                next_index: self.i_committed + 1,
                match_index: 0,
            },
        );
        Ok(entry)
    }

    /// Append a `remove_follower` entry. Fails if another membership change
    /// is still uncommitted. Progress bookkeeping for the peer is dropped
    /// when the entry commits.
    pub fn prepare_to_remove_follower(
        &mut self,
        members: &Members,
        term: TermNumber,
        pid: NodeId,
    ) -> Result<LogEntry, MembersError> {
        if members.uncommitted_membership_change.is_some() {
            return Err(MembersError::UncommittedMembershipChange);
        }
        Ok(self.add_entry(term, EntryPayload::RemoveFollower { follower: pid }))
    }

    /// Record a successful replication response: raise the follower's match
    /// index monotonically and advance the commit index to the highest N
    /// from the current term replicated on a majority of the voting
    /// membership (self counts implicitly). Earlier-term entries commit
    /// transitively. Returns the newly committed entries.
    pub fn set_follower_index(
        &mut self,
        members: &Members,
        me: NodeId,
        current_term: TermNumber,
        from: NodeId,
        i_replicated: LogIndex,
        config: &RaftConfig,
    ) -> Vec<LogEntry> {
        let Some(indices) = self.followers.get_mut(&from) else {
            return Vec::new();
        };
        if i_replicated > indices.match_index {
            indices.match_index = i_replicated;
        }
        if i_replicated + 1 > indices.next_index {
            indices.next_index = i_replicated + 1;
        }

        let majority = members.voter_count() / 2 + 1;
        let mut new_commit = self.i_committed;
        for index in (self.i_committed + 1..=self.last_index()).rev() {
            let entry = match self.entries.get(&index) {
                Some(e) => e,
                None => continue,
            };
            // Only current-term entries may be committed by counting
            if entry.term != current_term {
                continue;
            }
            let replicas = members
                .all_members()
                .iter()
                .filter(|&&m| {
                    m == me
                        || self
                            .followers
                            .get(&m)
                            .map(|f| f.match_index >= index)
                            .unwrap_or(false)
                })
                .count();
            if replicas >= majority {
                new_commit = index;
                break;
            }
        }

        let applicable = self.advance_commit(new_commit);
        self.apply_retention(config);
        applicable
    }

    /// Back off after a failed AppendEntries (floored at 1)
    pub fn decrement_next_index_of_follower(&mut self, from: NodeId) {
        if let Some(indices) = self.followers.get_mut(&from) {
            if indices.next_index > 1 {
                indices.next_index -= 1;
            }
        }
    }

    /// Lonely-leader commit: everything in the log is committed
    pub fn commit_to_latest(&mut self, config: &RaftConfig) -> Vec<LogEntry> {
        let applicable = self.advance_commit(self.last_index());
        self.apply_retention(config);
        applicable
    }

    /// Build the AppendEntries request for one follower, carrying entries
    /// from its next index onward.
    pub fn make_append_entries_req(
        &mut self,
        me: NodeId,
        term: TermNumber,
        follower: NodeId,
    ) -> AppendEntriesPrep {
        let Some(indices) = self.followers.get(&follower) else {
            return AppendEntriesPrep::UnknownFollower;
        };
        let next_index = indices.next_index;
        let prev_log_index = next_index - 1;

        if prev_log_index > 0 && prev_log_index < self.i_min() {
            // The follower needs entries we no longer retain
            if let Some(indices) = self.followers.get_mut(&follower) {
                indices.next_index = self.i_committed + 1;
            }
            return AppendEntriesPrep::SnapshotNeeded;
        }

        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            match self.entries.get(&prev_log_index) {
                Some(entry) => entry.term,
                None => return AppendEntriesPrep::SnapshotNeeded,
            }
        };
        let entries: Vec<LogEntry> = self
            .entries
            .range(next_index..)
            .map(|(_, e)| e.clone())
            .collect();

        AppendEntriesPrep::Request(AppendEntriesRequest {
            term,
            leader: me,
            prev_log_term,
            prev_log_index,
            entries,
            i_leader_commit: self.i_committed,
        })
    }

    /// Election restriction (Raft §5.4.1): true iff the candidate's last
    /// (term, index) is at least ours, compared lexicographically.
    pub fn candidate_log_up_to_date(&self, last_log_of_candidate: (TermNumber, LogIndex)) -> bool {
        last_log_of_candidate >= (self.last_term(), self.last_index())
    }

    /// Match index of a follower, if tracked
    pub fn match_index_of(&self, follower: NodeId) -> Option<LogIndex> {
        self.followers.get(&follower).map(|f| f.match_index)
    }

    /// Drop replication progress for a removed follower
    pub fn remove_follower_indices(&mut self, pid: NodeId) {
        self.followers.remove(&pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log_entry::ClientRef;

    fn command(term: TermNumber, index: LogIndex, arg: &str, id: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            payload: EntryPayload::Command {
                client: ClientRef { node: 1, seq: id },
                arg: arg.to_string(),
                id,
            },
        }
    }

    fn three_members() -> Members {
        let mut members = Members::new_for_lonely_leader(1);
        for (index, follower) in [(100u64, 2u64), (101, 3)] {
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

    /// A leader log seeded past its boot entry, with follower tracking
    fn leader_logs(members: &Members) -> Logs {
        let mut logs = Logs::new_for_lonely_leader(1);
        logs.elected_leader(members, 1, 1);
        logs
    }

    #[test]
    fn test_lonely_leader_log_is_seeded_and_committed() {
        let logs = Logs::new_for_lonely_leader(1);
        assert_eq!(logs.last_index(), 1);
        assert_eq!(logs.last_term(), 0);
        assert_eq!(logs.i_committed(), 1);
        assert_eq!(logs.last_entry(), logs.last_committed_entry());
    }

    #[test]
    fn test_contain_given_prev_log() {
        let mut logs = Logs::new_for_lonely_leader(1);
        logs.add_entry(2, EntryPayload::LeaderElected { leader: 1 });

        assert!(logs.contain_given_prev_log(0, 0));
        assert!(logs.contain_given_prev_log(0, 1));
        assert!(logs.contain_given_prev_log(2, 2));
        assert!(!logs.contain_given_prev_log(1, 2), "term mismatch");
        assert!(!logs.contain_given_prev_log(2, 5), "missing index");
    }

    #[test]
    fn test_append_entries_appends_and_commits() {
        let mut members = three_members();
        let mut logs = Logs::new_for_lonely_leader(1);
        let config = RaftConfig::default();

        let incoming = vec![command(1, 2, "SET x 1", 1), command(1, 3, "SET y 2", 2)];
        let applicable = logs.append_entries(&mut members, &incoming, 2, &config);

        assert_eq!(logs.last_index(), 3);
        assert_eq!(logs.i_committed(), 2);
        assert_eq!(applicable.len(), 1);
        assert_eq!(applicable[0].index, 2);
    }

    #[test]
    fn test_append_entries_commit_capped_by_log_length() {
        let mut members = three_members();
        let mut logs = Logs::new_for_lonely_leader(1);
        let config = RaftConfig::default();

        let incoming = vec![command(1, 2, "SET x 1", 1)];
        let applicable = logs.append_entries(&mut members, &incoming, 10, &config);

        assert_eq!(logs.i_committed(), 2);
        assert_eq!(applicable.len(), 1);
    }

    #[test]
    fn test_append_entries_is_idempotent() {
        let mut members = three_members();
        let mut logs = Logs::new_for_lonely_leader(1);
        let config = RaftConfig::default();

        let incoming = vec![command(1, 2, "SET x 1", 1)];
        logs.append_entries(&mut members, &incoming, 0, &config);
        logs.append_entries(&mut members, &incoming, 0, &config);

        assert_eq!(logs.last_index(), 2);
    }

    #[test]
    fn test_conflicting_entry_truncates_suffix() {
        let mut members = three_members();
        let mut logs = Logs::new_for_lonely_leader(1);
        let config = RaftConfig::default();

        let old = vec![command(1, 2, "OLD 2", 1), command(1, 3, "OLD 3", 2)];
        logs.append_entries(&mut members, &old, 0, &config);

        let new = vec![command(2, 2, "NEW 2", 3)];
        logs.append_entries(&mut members, &new, 0, &config);

        assert_eq!(logs.last_index(), 2);
        assert_eq!(logs.last_term(), 2);
        assert!(matches!(
            &logs.last_entry().payload,
            EntryPayload::Command { arg, .. } if arg == "NEW 2"
        ));
    }

    #[test]
    fn test_appended_membership_entry_adjusts_voting_set() {
        let mut members = three_members();
        let mut logs = Logs::new_for_lonely_leader(1);
        let config = RaftConfig::default();

        let add = LogEntry {
            term: 1,
            index: 2,
            payload: EntryPayload::AddFollower { follower: 4 },
        };
        logs.append_entries(&mut members, std::slice::from_ref(&add), 0, &config);

        // The new configuration takes effect at append time
        assert!(members.contains(4));
        assert!(members.uncommitted_membership_change.is_some());

        // Committing the entry keeps the member and clears the record
        logs.append_entries(&mut members, &[], 2, &config);
        members.membership_change_committed(2);
        assert!(members.contains(4));
        assert!(members.uncommitted_membership_change.is_none());
    }

    #[test]
    fn test_truncation_reverts_uncommitted_membership_change() {
        let mut members = three_members();
        let mut logs = Logs::new_for_lonely_leader(1);
        let config = RaftConfig::default();

        // Entry 2 is an uncommitted add_follower
        let add = LogEntry {
            term: 1,
            index: 2,
            payload: EntryPayload::AddFollower { follower: 4 },
        };
        logs.append_entries(&mut members, std::slice::from_ref(&add), 0, &config);
        assert!(members.contains(4));

        // A new leader overwrites index 2 with a different-term entry: the
        // membership change is rolled back along with the truncated entry
        let new = vec![command(2, 2, "NEW 2", 3)];
        logs.append_entries(&mut members, &new, 0, &config);

        assert!(members.uncommitted_membership_change.is_none());
        assert!(!members.contains(4));
    }

    #[test]
    fn test_elected_leader_initializes_follower_progress() {
        let members = three_members();
        let mut logs = Logs::new_for_lonely_leader(1);
        let entry = logs.elected_leader(&members, 1, 3);

        assert!(matches!(entry.payload, EntryPayload::LeaderElected { leader: 1 }));
        assert_eq!(entry.index, 2);
        // next_index points at the leader_elected entry itself
        match logs.make_append_entries_req(1, 3, 2) {
            AppendEntriesPrep::Request(req) => {
                assert_eq!(req.prev_log_index, 1);
                assert_eq!(req.entries.len(), 1);
                assert_eq!(req.entries[0].index, 2);
            }
            other => panic!("expected request, got {:?}", other),
        }
        assert_eq!(logs.match_index_of(2), Some(0));
    }

    #[test]
    fn test_set_follower_index_commits_on_majority() {
        let members = three_members();
        let config = RaftConfig::default();
        let mut logs = leader_logs(&members); // leader_elected at index 2, term 1
        logs.add_entry(1, command(1, 3, "SET x 1", 1).payload);

        // One follower at index 3: leader + follower = 2 of 3
        let applicable = logs.set_follower_index(&members, 1, 1, 2, 3, &config);
        assert_eq!(logs.i_committed(), 3);
        assert_eq!(applicable.len(), 2, "entries 2 and 3 commit together");

        // The other follower catching up later commits nothing new
        let applicable = logs.set_follower_index(&members, 1, 1, 3, 3, &config);
        assert!(applicable.is_empty());
    }

    #[test]
    fn test_match_index_is_monotonic() {
        let members = three_members();
        let config = RaftConfig::default();
        let mut logs = leader_logs(&members);

        logs.set_follower_index(&members, 1, 1, 2, 2, &config);
        assert_eq!(logs.match_index_of(2), Some(2));

        // Stale response cannot lower it
        logs.set_follower_index(&members, 1, 1, 2, 1, &config);
        assert_eq!(logs.match_index_of(2), Some(2));
    }

    #[test]
    fn test_earlier_term_entries_not_committed_by_counting() {
        let members = three_members();
        let config = RaftConfig::default();
        let mut logs = leader_logs(&members); // entries: 1 (term 0), 2 (term 1)

        // Leader is now at term 2 but entry 2 is from term 1
        let applicable = logs.set_follower_index(&members, 1, 2, 2, 2, &config);
        assert!(applicable.is_empty());
        assert_eq!(logs.i_committed(), 1);

        // A term-2 entry replicated to a majority commits both
        logs.add_entry(2, EntryPayload::LeaderElected { leader: 1 });
        let applicable = logs.set_follower_index(&members, 1, 2, 2, 3, &config);
        assert_eq!(logs.i_committed(), 3);
        assert_eq!(applicable.len(), 2);
    }

    #[test]
    fn test_decrement_next_index_floors_at_one() {
        let members = three_members();
        let mut logs = leader_logs(&members);

        logs.decrement_next_index_of_follower(2);
        match logs.make_append_entries_req(1, 1, 2) {
            AppendEntriesPrep::Request(req) => assert_eq!(req.prev_log_index, 0),
            other => panic!("expected request, got {:?}", other),
        }
        // Already at 1; further decrements are no-ops
        logs.decrement_next_index_of_follower(2);
        match logs.make_append_entries_req(1, 1, 2) {
            AppendEntriesPrep::Request(req) => assert_eq!(req.prev_log_index, 0),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_commit_to_latest() {
        let members = three_members();
        let config = RaftConfig::default();
        let mut logs = leader_logs(&members);
        logs.add_entry(1, command(1, 3, "SET x 1", 1).payload);

        let applicable = logs.commit_to_latest(&config);
        assert_eq!(logs.i_committed(), 3);
        assert_eq!(applicable.len(), 2);
    }

    #[test]
    fn test_request_for_removed_follower_errors() {
        let members = three_members();
        let mut logs = leader_logs(&members);
        logs.remove_follower_indices(2);
        assert!(matches!(
            logs.make_append_entries_req(1, 1, 2),
            AppendEntriesPrep::UnknownFollower
        ));
    }

    #[test]
    fn test_retention_drops_old_committed_entries_and_forces_snapshot() {
        let members = three_members();
        let config = RaftConfig::default().with_max_retained_committed_logs(2);
        let mut logs = leader_logs(&members);

        for i in 0..10u64 {
            logs.add_entry(1, command(1, 0, &format!("SET k{} v", i), i).payload);
        }
        logs.set_follower_index(&members, 1, 1, 2, logs.last_index(), &config);
        assert_eq!(logs.i_committed(), 12);

        // Follower 3 never progressed; its next index now precedes the
        // retained window, so it must get a snapshot and be reset
        match logs.make_append_entries_req(1, 1, 3) {
            AppendEntriesPrep::SnapshotNeeded => {}
            other => panic!("expected snapshot, got {:?}", other),
        }
        match logs.make_append_entries_req(1, 1, 3) {
            AppendEntriesPrep::Request(req) => {
                assert_eq!(req.prev_log_index, logs.i_committed());
                assert!(req.entries.is_empty());
            }
            other => panic!("expected request after reset, got {:?}", other),
        }
    }

    #[test]
    fn test_prepare_membership_entries_guard_in_flight_change() {
        let mut members = three_members();
        let mut logs = leader_logs(&members);

        let entry = logs.prepare_to_add_follower(&members, 1, 4).unwrap();
        members.start_adding_follower(entry.clone()).unwrap();

        assert_eq!(
            logs.prepare_to_add_follower(&members, 1, 5).unwrap_err(),
            MembersError::UncommittedMembershipChange
        );
        assert_eq!(
            logs.prepare_to_remove_follower(&members, 1, 2).unwrap_err(),
            MembersError::UncommittedMembershipChange
        );

        // New follower is served from the commit point
        match logs.make_append_entries_req(1, 1, 4) {
            AppendEntriesPrep::Request(req) => {
                assert_eq!(req.prev_log_index, logs.i_committed());
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_candidate_log_up_to_date_is_lexicographic() {
        let mut logs = Logs::new_for_lonely_leader(1);
        logs.add_entry(2, EntryPayload::LeaderElected { leader: 1 }); // last = (2, 2)

        assert!(logs.candidate_log_up_to_date((2, 2)), "equal is up to date");
        assert!(logs.candidate_log_up_to_date((2, 3)), "longer same-term log");
        assert!(logs.candidate_log_up_to_date((3, 1)), "higher term wins");
        assert!(!logs.candidate_log_up_to_date((2, 1)), "shorter same-term log");
        assert!(!logs.candidate_log_up_to_date((1, 9)), "lower term loses");
    }
}
