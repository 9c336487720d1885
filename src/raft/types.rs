//! Core log/term types and entry serialization (spec.md §3, §6).

use crate::common::NodeId;
use crate::error::{DbError, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// 64-bit position in the replicated log.
pub type LogIndex = u64;

/// Monotonically increasing leadership epoch.
pub type Term = u64;

/// Sentinel stored in `voted_for` meaning "vote already spent for this
/// term" without naming a candidate — used when a node observes a leader
/// before casting a real vote (spec.md §4.2).
pub const BLOCKED_VOTE: &str = "\0blocked-vote\0";

/// A log entry's payload. Three shapes carry control meaning to the core;
/// anything else is an opaque command for the state machine (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Membership change. Takes effect on append, not on commit.
    UpdateMembers {
        serialized_members: String,
        cluster_id: String,
    },
    /// No-op entry appended by a freshly elected leader to anchor its term.
    LeadershipMarker { term: Term, leader: NodeId },
    /// Opaque payload for the state machine: an ordered sequence of binary
    /// tokens, mirroring the RESP command the client sent.
    Data(Vec<Vec<u8>>),
}

impl Command {
    pub fn is_control(&self) -> bool {
        matches!(self, Command::UpdateMembers { .. } | Command::LeadershipMarker { .. })
    }
}

/// `(term, command)`, the unit stored at each log index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub command: Command,
}

impl LogEntry {
    pub fn new(term: Term, command: Command) -> Self {
        Self { term, command }
    }

    /// Wire encoding per spec.md §6: 64-bit little-endian term, then for
    /// each command token a 64-bit length followed by bytes, trailed by a
    /// CRC32 of everything before it. Control commands are encoded through
    /// a reserved leading token so `deserialize(serialize(e)) == e`
    /// round-trips exactly.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.term);
        let tokens = self.command.to_tokens();
        for token in &tokens {
            buf.put_u64_le(token.len() as u64);
            buf.put_slice(token);
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.to_vec()
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < 12 {
            return Err(DbError::Serialization("entry too short".into()));
        }
        let (body, trailer) = buf.split_at(buf.len() - 4);
        let expected = u32::from_le_bytes(trailer.try_into().unwrap());
        let actual = crc32fast::hash(body);
        if actual != expected {
            return Err(DbError::Serialization(format!(
                "checksum mismatch: expected {expected:#x}, computed {actual:#x}"
            )));
        }

        let mut cursor = body;
        if cursor.remaining() < 8 {
            return Err(DbError::Serialization("entry too short".into()));
        }
        let term = cursor.get_u64_le();
        let mut tokens = Vec::new();
        while cursor.has_remaining() {
            if cursor.remaining() < 8 {
                return Err(DbError::Serialization("truncated token length".into()));
            }
            let len = cursor.get_u64_le() as usize;
            if cursor.remaining() < len {
                return Err(DbError::Serialization("truncated token body".into()));
            }
            tokens.push(cursor.copy_to_bytes(len).to_vec());
        }
        let command = Command::from_tokens(&tokens)?;
        Ok(LogEntry { term, command })
    }
}

impl Command {
    fn to_tokens(&self) -> Vec<Vec<u8>> {
        match self {
            Command::UpdateMembers { serialized_members, cluster_id } => vec![
                b"\0UPDATE_MEMBERS\0".to_vec(),
                serialized_members.clone().into_bytes(),
                cluster_id.clone().into_bytes(),
            ],
            Command::LeadershipMarker { term, leader } => vec![
                b"\0LEADERSHIP_MARKER\0".to_vec(),
                term.to_le_bytes().to_vec(),
                leader.clone().into_bytes(),
            ],
            Command::Data(tokens) => tokens.clone(),
        }
    }

    fn from_tokens(tokens: &[Vec<u8>]) -> Result<Self> {
        match tokens.first().map(|t| t.as_slice()) {
            Some(b"\0UPDATE_MEMBERS\0") => {
                let members = tokens
                    .get(1)
                    .ok_or_else(|| DbError::Serialization("missing members token".into()))?;
                let cluster_id = tokens
                    .get(2)
                    .ok_or_else(|| DbError::Serialization("missing cluster_id token".into()))?;
                Ok(Command::UpdateMembers {
                    serialized_members: String::from_utf8_lossy(members).into_owned(),
                    cluster_id: String::from_utf8_lossy(cluster_id).into_owned(),
                })
            }
            Some(b"\0LEADERSHIP_MARKER\0") => {
                let term_bytes = tokens
                    .get(1)
                    .ok_or_else(|| DbError::Serialization("missing marker term".into()))?;
                let term = Term::from_le_bytes(
                    term_bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| DbError::Serialization("bad marker term".into()))?,
                );
                let leader = tokens
                    .get(2)
                    .ok_or_else(|| DbError::Serialization("missing marker leader".into()))?;
                Ok(Command::LeadershipMarker {
                    term,
                    leader: String::from_utf8_lossy(leader).into_owned(),
                })
            }
            _ => Ok(Command::Data(tokens.to_vec())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_entry_round_trips() {
        let entry = LogEntry::new(3, Command::Data(vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]));
        let bytes = entry.serialize();
        let back = LogEntry::deserialize(&bytes).unwrap();
        assert_eq!(entry, back);
    }

    #[test]
    fn update_members_entry_round_trips() {
        let entry = LogEntry::new(
            0,
            Command::UpdateMembers {
                serialized_members: "a:1,b:2|".to_string(),
                cluster_id: "cluster-uuid".to_string(),
            },
        );
        let bytes = entry.serialize();
        let back = LogEntry::deserialize(&bytes).unwrap();
        assert_eq!(entry, back);
    }

    #[test]
    fn leadership_marker_round_trips() {
        let entry = LogEntry::new(5, Command::LeadershipMarker { term: 5, leader: "a:1".into() });
        let bytes = entry.serialize();
        let back = LogEntry::deserialize(&bytes).unwrap();
        assert_eq!(entry, back);
        assert!(back.command.is_control());
    }

    #[test]
    fn deserialize_rejects_truncated_buffer() {
        let entry = LogEntry::new(1, Command::Data(vec![b"X".to_vec()]));
        let mut bytes = entry.serialize();
        bytes.truncate(bytes.len() - 1);
        assert!(LogEntry::deserialize(&bytes).is_err());
    }
}
