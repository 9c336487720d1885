//! Minimal RESP-shaped reply encoding for the raft control surface
//! (spec.md §6). Full command parsing and the general data-path protocol
//! are external collaborators (spec.md §1); this module only renders the
//! handful of reply shapes the dispatcher itself produces.

use crate::raft::types::{LogIndex, Term};

/// `+OK\r\n`
pub fn simple_ok() -> Vec<u8> {
    b"+OK\r\n".to_vec()
}

/// `$<len>\r\n<bytes>\r\n`
pub fn bulk(bytes: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", bytes.len()).into_bytes();
    out.extend_from_slice(bytes);
    out.extend_from_slice(b"\r\n");
    out
}

/// `$-1\r\n`
pub fn nil() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

/// `-ERR <message>\r\n`
pub fn error(message: &str) -> Vec<u8> {
    format!("-ERR {message}\r\n").into_bytes()
}

/// `-WRONGTYPE <message>\r\n`
pub fn wrong_type(message: &str) -> Vec<u8> {
    format!("-WRONGTYPE {message}\r\n").into_bytes()
}

/// `-MOVED <redirectTarget>\r\n` — sent when a non-leader receives a write
/// or a linearizable read and knows who the leader is (spec.md §4.8).
pub fn moved(target: &str) -> Vec<u8> {
    format!("-MOVED {target}\r\n").into_bytes()
}

/// `:<term>:<recognizedAsLeader>\r\n` heartbeat acknowledgement.
pub fn heartbeat_reply(term: Term, recognized_as_leader: bool) -> Vec<u8> {
    format!(":{term}:{}\r\n", recognized_as_leader as u8).into_bytes()
}

/// `:<term>:<logSize>:<success>\r\n` append-entries acknowledgement.
pub fn append_entries_reply(term: Term, log_size: LogIndex, success: bool) -> Vec<u8> {
    format!(":{term}:{log_size}:{}\r\n", success as u8).into_bytes()
}

/// `:<term>:<reply>\r\n` where reply is one of `granted`/`refused`/`veto`.
pub fn request_vote_reply(term: Term, reply: &str) -> Vec<u8> {
    format!(":{term}:{reply}\r\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_frames_length_and_body() {
        assert_eq!(bulk(b"hi"), b"$2\r\nhi\r\n".to_vec());
    }

    #[test]
    fn moved_includes_target() {
        assert_eq!(moved("a:1"), b"-MOVED a:1\r\n".to_vec());
    }

    #[test]
    fn heartbeat_reply_encodes_term_and_flag() {
        assert_eq!(heartbeat_reply(7, true), b":7:1\r\n".to_vec());
    }
}
