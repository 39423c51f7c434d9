//! Replicated log entries and their binary encoding

use serde::{Deserialize, Serialize};

use super::config::RaftConfig;

/// Monotonically increasing election epoch
pub type TermNumber = u64;
/// Position in the replicated log (1-indexed; 0 means "before the first entry")
pub type LogIndex = u64;
/// Identity of a consensus group member
pub type NodeId = u64;
/// Client-chosen identifier used to deduplicate retried commands
pub type CommandId = u64;

/// Serializable handle for routing an asynchronous reply back to a client.
///
/// Minted by the client facade when a command or query is submitted; whoever
/// is leader when the entry commits answers through `Comm::reply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientRef {
    /// Node the client submitted through
    pub node: NodeId,
    /// Per-node request sequence number
    pub seq: u64,
}

/// Payload of a log entry, one variant per entry kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// State-changing client operation
    Command {
        client: ClientRef,
        arg: String,
        id: CommandId,
    },
    /// Read-only client operation, logged only when the leader lease is invalid
    Query { client: ClientRef, arg: String },
    /// Replace the group's tunable configuration
    ChangeConfig { config: RaftConfig },
    /// Appended by a newly elected leader; allows committing earlier-term
    /// entries indirectly
    LeaderElected { leader: NodeId },
    /// Single-server membership change: add a follower
    AddFollower { follower: NodeId },
    /// Single-server membership change: remove a follower
    RemoveFollower { follower: NodeId },
}

const TAG_COMMAND: u8 = 0;
const TAG_QUERY: u8 = 1;
const TAG_CHANGE_CONFIG: u8 = 2;
const TAG_LEADER_ELECTED: u8 = 3;
const TAG_ADD_FOLLOWER: u8 = 4;
const TAG_REMOVE_FOLLOWER: u8 = 5;

/// A single replicated log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when the entry was appended by a leader
    pub term: TermNumber,
    /// Index in the log (1-indexed)
    pub index: LogIndex,
    /// The entry's payload
    pub payload: EntryPayload,
}

impl LogEntry {
    /// Wire tag identifying the payload kind
    pub fn kind_tag(&self) -> u8 {
        match &self.payload {
            EntryPayload::Command { .. } => TAG_COMMAND,
            EntryPayload::Query { .. } => TAG_QUERY,
            EntryPayload::ChangeConfig { .. } => TAG_CHANGE_CONFIG,
            EntryPayload::LeaderElected { .. } => TAG_LEADER_ELECTED,
            EntryPayload::AddFollower { .. } => TAG_ADD_FOLLOWER,
            EntryPayload::RemoveFollower { .. } => TAG_REMOVE_FOLLOWER,
        }
    }

    /// Encode the entry as
    /// `term:be64 | index:be64 | kind_tag:u8 | payload_len:be64 | payload`.
    ///
    /// The payload bytes are the bincode encoding of the variant's fields;
    /// the header codec treats them as opaque.
    pub fn to_binary(&self) -> Vec<u8> {
        let payload = self.payload_bytes();
        let mut buf = Vec::with_capacity(8 + 8 + 1 + 8 + payload.len());
        buf.extend_from_slice(&self.term.to_be_bytes());
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.push(self.kind_tag());
        buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    fn payload_bytes(&self) -> Vec<u8> {
        // Serialization of these in-memory variants cannot fail
        match &self.payload {
            EntryPayload::Command { client, arg, id } => {
                bincode::serialize(&(client, arg, id)).expect("encode command payload")
            }
            EntryPayload::Query { client, arg } => {
                bincode::serialize(&(client, arg)).expect("encode query payload")
            }
            EntryPayload::ChangeConfig { config } => {
                bincode::serialize(config).expect("encode config payload")
            }
            EntryPayload::LeaderElected { leader } => {
                bincode::serialize(leader).expect("encode leader payload")
            }
            EntryPayload::AddFollower { follower } | EntryPayload::RemoveFollower { follower } => {
                bincode::serialize(follower).expect("encode follower payload")
            }
        }
    }

    /// Decode one entry from the front of `bytes`, returning the entry and
    /// the unconsumed rest.
    ///
    /// Returns `None` on any parse failure: short header, unknown kind tag,
    /// payload length overflowing the buffer, or payload decode error.
    /// Never yields a partial entry.
    pub fn extract_from_binary(bytes: &[u8]) -> Option<(LogEntry, &[u8])> {
        if bytes.len() < 25 {
            return None;
        }
        let term = u64::from_be_bytes(bytes[0..8].try_into().ok()?);
        let index = u64::from_be_bytes(bytes[8..16].try_into().ok()?);
        let tag = bytes[16];
        let payload_len = u64::from_be_bytes(bytes[17..25].try_into().ok()?);
        let rest = &bytes[25..];
        let payload_len = usize::try_from(payload_len).ok()?;
        if payload_len > rest.len() {
            return None;
        }
        let (payload_bytes, rest) = rest.split_at(payload_len);

        let payload = match tag {
            TAG_COMMAND => {
                let (client, arg, id): (ClientRef, String, CommandId) =
                    bincode::deserialize(payload_bytes).ok()?;
                EntryPayload::Command { client, arg, id }
            }
            TAG_QUERY => {
                let (client, arg): (ClientRef, String) =
                    bincode::deserialize(payload_bytes).ok()?;
                EntryPayload::Query { client, arg }
            }
            TAG_CHANGE_CONFIG => EntryPayload::ChangeConfig {
                config: bincode::deserialize(payload_bytes).ok()?,
            },
            TAG_LEADER_ELECTED => EntryPayload::LeaderElected {
                leader: bincode::deserialize(payload_bytes).ok()?,
            },
            TAG_ADD_FOLLOWER => EntryPayload::AddFollower {
                follower: bincode::deserialize(payload_bytes).ok()?,
            },
            TAG_REMOVE_FOLLOWER => EntryPayload::RemoveFollower {
                follower: bincode::deserialize(payload_bytes).ok()?,
            },
            _ => return None,
        };

        Some((LogEntry { term, index, payload }, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<LogEntry> {
        let client = ClientRef { node: 1, seq: 7 };
        vec![
            LogEntry {
                term: 3,
                index: 10,
                payload: EntryPayload::Command {
                    client,
                    arg: "SET x 1".to_string(),
                    id: 42,
                },
            },
            LogEntry {
                term: 3,
                index: 11,
                payload: EntryPayload::Query {
                    client,
                    arg: "GET x".to_string(),
                },
            },
            LogEntry {
                term: 4,
                index: 12,
                payload: EntryPayload::ChangeConfig {
                    config: RaftConfig::default(),
                },
            },
            LogEntry {
                term: 4,
                index: 13,
                payload: EntryPayload::LeaderElected { leader: 2 },
            },
            LogEntry {
                term: 4,
                index: 14,
                payload: EntryPayload::AddFollower { follower: 5 },
            },
            LogEntry {
                term: 5,
                index: 15,
                payload: EntryPayload::RemoveFollower { follower: 5 },
            },
        ]
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        for entry in sample_entries() {
            let bytes = entry.to_binary();
            let (decoded, rest) = LogEntry::extract_from_binary(&bytes).unwrap();
            assert_eq!(decoded, entry);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn test_kind_tags_are_stable() {
        let tags: Vec<u8> = sample_entries().iter().map(|e| e.kind_tag()).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_extract_consumes_one_entry_from_stream() {
        let entries = sample_entries();
        let mut stream = Vec::new();
        for entry in &entries {
            stream.extend_from_slice(&entry.to_binary());
        }

        let mut rest: &[u8] = &stream;
        let mut decoded = Vec::new();
        while !rest.is_empty() {
            let (entry, tail) = LogEntry::extract_from_binary(rest).unwrap();
            decoded.push(entry);
            rest = tail;
        }
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_short_header_is_rejected() {
        assert!(LogEntry::extract_from_binary(&[]).is_none());
        assert!(LogEntry::extract_from_binary(&[0u8; 24]).is_none());
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let entry = &sample_entries()[0];
        let mut bytes = entry.to_binary();
        bytes[16] = 99;
        assert!(LogEntry::extract_from_binary(&bytes).is_none());
    }

    #[test]
    fn test_overlong_payload_length_is_rejected() {
        let entry = &sample_entries()[0];
        let mut bytes = entry.to_binary();
        // Claim a payload far past the end of the buffer
        bytes[17..25].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(LogEntry::extract_from_binary(&bytes).is_none());
    }

    #[test]
    fn test_corrupt_payload_is_rejected() {
        let entry = LogEntry {
            term: 1,
            index: 1,
            payload: EntryPayload::Query {
                client: ClientRef { node: 1, seq: 1 },
                arg: "GET k".to_string(),
            },
        };
        let mut bytes = entry.to_binary();
        // Truncate mid-payload but fix up the claimed length so only the
        // payload decode can fail
        let cut = bytes.len() - 3;
        bytes.truncate(cut);
        let payload_len = (cut - 25) as u64;
        bytes[17..25].copy_from_slice(&payload_len.to_be_bytes());
        assert!(LogEntry::extract_from_binary(&bytes).is_none());
    }
}
