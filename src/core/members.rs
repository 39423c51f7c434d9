//! Consensus group membership bookkeeping

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::log_entry::{EntryPayload, LogEntry, LogIndex, NodeId};

/// Errors raised by membership operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembersError {
    /// Another add/remove entry is still uncommitted
    UncommittedMembershipChange,
    /// The named peer is not (or already is) a member
    UnknownFollower,
}

/// The voting membership of the group as this replica knows it.
///
/// Per Raft single-server membership change, the voting set is adjusted as
/// soon as the add/remove entry is appended, not when it commits; at most
/// one such entry may be in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Members {
    /// All member identities, including this replica
    all: BTreeSet<NodeId>,
    /// Current leader, if known
    pub leader: Option<NodeId>,
    /// The single in-flight add/remove entry, if any
    pub uncommitted_membership_change: Option<LogEntry>,
    /// Follower chosen as the leader-replacement target, if any
    pub pending_leader_change: Option<NodeId>,
}

impl Members {
    /// Membership of a freshly booted single-member group
    pub fn new_for_lonely_leader(leader: NodeId) -> Self {
        let mut all = BTreeSet::new();
        all.insert(leader);
        Members {
            all,
            leader: Some(leader),
            uncommitted_membership_change: None,
            pending_leader_change: None,
        }
    }

    pub fn put_leader(&mut self, leader: Option<NodeId>) {
        self.leader = leader;
    }

    /// All members of the voting set
    pub fn all_members(&self) -> &BTreeSet<NodeId> {
        &self.all
    }

    pub fn contains(&self, member: NodeId) -> bool {
        self.all.contains(&member)
    }

    /// Size of the voting set
    pub fn voter_count(&self) -> usize {
        self.all.len()
    }

    /// Members other than `me`
    pub fn other_members_list(&self, me: NodeId) -> Vec<NodeId> {
        self.all.iter().copied().filter(|&m| m != me).collect()
    }

    /// Adopt an appended `add_follower` entry: record it as the in-flight
    /// change and grow the voting set immediately.
    pub fn start_adding_follower(&mut self, entry: LogEntry) -> Result<(), MembersError> {
        if self.uncommitted_membership_change.is_some() {
            return Err(MembersError::UncommittedMembershipChange);
        }
        let follower = match &entry.payload {
            EntryPayload::AddFollower { follower } => *follower,
            _ => return Err(MembersError::UnknownFollower),
        };
        if !self.all.insert(follower) {
            return Err(MembersError::UnknownFollower);
        }
        self.uncommitted_membership_change = Some(entry);
        Ok(())
    }

    /// Adopt an appended `remove_follower` entry: record it as the in-flight
    /// change and shrink the voting set immediately.
    pub fn start_removing_follower(&mut self, entry: LogEntry) -> Result<(), MembersError> {
        if self.uncommitted_membership_change.is_some() {
            return Err(MembersError::UncommittedMembershipChange);
        }
        let follower = match &entry.payload {
            EntryPayload::RemoveFollower { follower } => *follower,
            _ => return Err(MembersError::UnknownFollower),
        };
        if !self.all.remove(&follower) {
            return Err(MembersError::UnknownFollower);
        }
        if self.pending_leader_change == Some(follower) {
            self.pending_leader_change = None;
        }
        self.uncommitted_membership_change = Some(entry);
        Ok(())
    }

    /// Clear the in-flight change once the entry at `index` has committed
    pub fn membership_change_committed(&mut self, index: LogIndex) {
        if let Some(entry) = &self.uncommitted_membership_change {
            if entry.index == index {
                self.uncommitted_membership_change = None;
            }
        }
    }

    /// Undo an in-flight change whose entry was truncated from the log:
    /// the voting-set adjustment is reverted along with the pending record.
    pub fn abort_uncommitted_change(&mut self) {
        if let Some(entry) = self.uncommitted_membership_change.take() {
            match &entry.payload {
                EntryPayload::AddFollower { follower } => {
                    self.all.remove(follower);
                }
                EntryPayload::RemoveFollower { follower } => {
                    self.all.insert(*follower);
                }
                _ => {}
            }
        }
    }

    /// Record (or cancel, with `None`) the leader-replacement target
    pub fn start_replacing_leader(
        &mut self,
        new_leader: Option<NodeId>,
    ) -> Result<(), MembersError> {
        if let Some(target) = new_leader {
            if !self.all.contains(&target) {
                return Err(MembersError::UnknownFollower);
            }
        }
        self.pending_leader_change = new_leader;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_entry(index: LogIndex, follower: NodeId) -> LogEntry {
        LogEntry {
            term: 1,
            index,
            payload: EntryPayload::AddFollower { follower },
        }
    }

    fn remove_entry(index: LogIndex, follower: NodeId) -> LogEntry {
        LogEntry {
            term: 1,
            index,
            payload: EntryPayload::RemoveFollower { follower },
        }
    }

    #[test]
    fn test_lonely_leader_membership() {
        let members = Members::new_for_lonely_leader(1);
        assert!(members.contains(1));
        assert_eq!(members.voter_count(), 1);
        assert_eq!(members.leader, Some(1));
        assert!(members.other_members_list(1).is_empty());
    }

    #[test]
    fn test_add_follower_takes_effect_immediately() {
        let mut members = Members::new_for_lonely_leader(1);
        members.start_adding_follower(add_entry(5, 2)).unwrap();

        assert!(members.contains(2));
        assert_eq!(members.other_members_list(1), vec![2]);
        assert!(members.uncommitted_membership_change.is_some());
    }

    #[test]
    fn test_second_change_rejected_while_one_in_flight() {
        let mut members = Members::new_for_lonely_leader(1);
        members.start_adding_follower(add_entry(5, 2)).unwrap();

        let err = members.start_adding_follower(add_entry(6, 3)).unwrap_err();
        assert_eq!(err, MembersError::UncommittedMembershipChange);

        let err = members.start_removing_follower(remove_entry(6, 2)).unwrap_err();
        assert_eq!(err, MembersError::UncommittedMembershipChange);
    }

    #[test]
    fn test_change_cleared_only_by_matching_index() {
        let mut members = Members::new_for_lonely_leader(1);
        members.start_adding_follower(add_entry(5, 2)).unwrap();

        members.membership_change_committed(4);
        assert!(members.uncommitted_membership_change.is_some());

        members.membership_change_committed(5);
        assert!(members.uncommitted_membership_change.is_none());

        // A new change can start now
        members.start_removing_follower(remove_entry(7, 2)).unwrap();
        assert!(!members.contains(2));
    }

    #[test]
    fn test_remove_unknown_follower_rejected() {
        let mut members = Members::new_for_lonely_leader(1);
        let err = members.start_removing_follower(remove_entry(5, 9)).unwrap_err();
        assert_eq!(err, MembersError::UnknownFollower);
    }

    #[test]
    fn test_replace_leader_requires_membership() {
        let mut members = Members::new_for_lonely_leader(1);
        members.start_adding_follower(add_entry(5, 2)).unwrap();

        assert!(members.start_replacing_leader(Some(9)).is_err());
        members.start_replacing_leader(Some(2)).unwrap();
        assert_eq!(members.pending_leader_change, Some(2));

        members.start_replacing_leader(None).unwrap();
        assert_eq!(members.pending_leader_change, None);
    }

    #[test]
    fn test_removing_pending_new_leader_cancels_transfer() {
        let mut members = Members::new_for_lonely_leader(1);
        members.start_adding_follower(add_entry(5, 2)).unwrap();
        members.membership_change_committed(5);
        members.start_replacing_leader(Some(2)).unwrap();

        members.start_removing_follower(remove_entry(6, 2)).unwrap();
        assert_eq!(members.pending_leader_change, None);
    }
}
