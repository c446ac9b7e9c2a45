//! Wire messages for the four RPCs and the log entry record.
//!
//! Everything that crosses a process boundary or touches disk is a protobuf
//! message encoded with a varint length prefix (`encode_frame` /
//! `decode_frame`). Integer fields are unsigned varints, strings and blobs
//! are length-prefixed, and unknown fields are skipped on decode, so old
//! peers tolerate messages from newer ones.
//!
//! Field numbers are part of the on-disk and on-wire contract; do not
//! renumber.

use bytes::{Buf, BufMut, Bytes};
use prost::Message;

use crate::error::{Error, Result};

/// A single replicated command record.
///
/// Indices are dense and 1-based; terms are non-decreasing along the log.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntry {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(string, tag = "3")]
    pub command_name: String,
    #[prost(bytes = "bytes", tag = "4")]
    pub command: Bytes,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, command_name: impl Into<String>, command: Bytes) -> Self {
        Self {
            index,
            term,
            command_name: command_name.into(),
            command,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendEntriesRequest {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub prev_log_index: u64,
    #[prost(uint64, tag = "3")]
    pub prev_log_term: u64,
    #[prost(uint64, tag = "4")]
    pub commit_index: u64,
    #[prost(string, tag = "5")]
    pub leader_name: String,
    #[prost(message, repeated, tag = "6")]
    pub entries: Vec<LogEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendEntriesResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// The responder's last log index; lets the leader back off in one hop
    /// instead of decrementing one index per round trip.
    #[prost(uint64, tag = "2")]
    pub index: u64,
    #[prost(uint64, tag = "3")]
    pub commit_index: u64,
    #[prost(bool, tag = "4")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestVoteRequest {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub last_log_index: u64,
    #[prost(uint64, tag = "3")]
    pub last_log_term: u64,
    #[prost(string, tag = "4")]
    pub candidate_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestVoteResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub vote_granted: bool,
}

/// Announces an imminent snapshot transfer so the follower can pause
/// normal log handling.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotRequest {
    #[prost(string, tag = "1")]
    pub leader_name: String,
    #[prost(uint64, tag = "2")]
    pub last_index: u64,
    #[prost(uint64, tag = "3")]
    pub last_term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotRecoveryRequest {
    #[prost(string, tag = "1")]
    pub leader_name: String,
    #[prost(uint64, tag = "2")]
    pub last_index: u64,
    #[prost(uint64, tag = "3")]
    pub last_term: u64,
    #[prost(message, repeated, tag = "4")]
    pub peers: Vec<SnapshotPeer>,
    #[prost(bytes = "bytes", tag = "5")]
    pub state: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotPeer {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub connection_string: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotRecoveryResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(uint64, tag = "3")]
    pub commit_index: u64,
}

/// Encodes `msg` as `varint(length) ‖ message` onto `buf`.
pub fn encode_frame<M: Message>(msg: &M, buf: &mut impl BufMut) -> Result<()> {
    msg.encode_length_delimited(buf)
        .map_err(|e| Error::Decode {
            cause: e.to_string(),
        })
}

/// Encoded size of `msg` including its length prefix.
pub fn frame_len<M: Message>(msg: &M) -> usize {
    let len = msg.encoded_len();
    prost::length_delimiter_len(len) + len
}

/// Decodes one length-prefixed message from the front of `buf`, advancing it.
pub fn decode_frame<M: Message + Default>(buf: &mut impl Buf) -> Result<M> {
    Ok(M::decode_length_delimited(buf)?)
}

/// Attempts to decode one frame from `data`.
///
/// Returns `Ok(Some((msg, consumed)))` for a complete frame, `Ok(None)` when
/// the buffer ends mid-frame (a torn tail, not an error), and `Err` when the
/// bytes are present but do not decode.
pub fn try_decode_frame<M: Message + Default>(data: &[u8]) -> Result<Option<(M, usize)>> {
    if data.is_empty() {
        return Ok(None);
    }
    let mut cursor = data;
    let len = match prost::decode_length_delimiter(&mut cursor) {
        Ok(len) => len,
        // A varint never exceeds 10 bytes; fewer remaining means a torn
        // prefix, anything else is corruption.
        Err(_) if data.len() < 10 => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let header = data.len() - cursor.len();
    if cursor.len() < len {
        return Ok(None);
    }
    let msg = M::decode(&cursor[..len])?;
    Ok(Some((msg, header + len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry::new(index, term, "write", Bytes::from_static(b"{\"k\":\"v\"}"))
    }

    #[test]
    fn log_entry_roundtrip() {
        let e = entry(7, 3);
        let mut buf = BytesMut::new();
        encode_frame(&e, &mut buf).unwrap();
        assert_eq!(buf.len(), frame_len(&e));

        let mut slice = buf.freeze();
        let back: LogEntry = decode_frame(&mut slice).unwrap();
        assert_eq!(back, e);
        assert!(slice.is_empty());
    }

    #[test]
    fn append_entries_roundtrip() {
        let req = AppendEntriesRequest {
            term: 4,
            prev_log_index: 10,
            prev_log_term: 3,
            commit_index: 9,
            leader_name: "a1b2c3d".into(),
            entries: vec![entry(11, 4), entry(12, 4)],
        };
        let mut buf = BytesMut::new();
        encode_frame(&req, &mut buf).unwrap();
        let back: AppendEntriesRequest = decode_frame(&mut buf.freeze()).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn snapshot_recovery_roundtrip() {
        let req = SnapshotRecoveryRequest {
            leader_name: "leader".into(),
            last_index: 42,
            last_term: 6,
            peers: vec![
                SnapshotPeer {
                    name: "n1".into(),
                    connection_string: "http://localhost:4001".into(),
                },
                SnapshotPeer {
                    name: "n2".into(),
                    connection_string: "http://localhost:4002".into(),
                },
            ],
            state: Bytes::from_static(b"\x00\x01\x02"),
        };
        let mut buf = BytesMut::new();
        encode_frame(&req, &mut buf).unwrap();
        let back: SnapshotRecoveryRequest = decode_frame(&mut buf.freeze()).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn torn_tail_is_not_an_error() {
        let e = entry(1, 1);
        let mut buf = BytesMut::new();
        encode_frame(&e, &mut buf).unwrap();
        let bytes = buf.freeze();

        for cut in 0..bytes.len() {
            let out = try_decode_frame::<LogEntry>(&bytes[..cut]).unwrap();
            assert!(out.is_none(), "truncation at {} decoded", cut);
        }
        let (back, consumed) = try_decode_frame::<LogEntry>(&bytes).unwrap().unwrap();
        assert_eq!(back, e);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        // A RequestVoteRequest is a superset of RequestVoteResponse's fields
        // (tag 1 is a varint in both); the extra fields must be skipped.
        let req = RequestVoteRequest {
            term: 9,
            last_log_index: 5,
            last_log_term: 2,
            candidate_name: "cand".into(),
        };
        let mut buf = BytesMut::new();
        encode_frame(&req, &mut buf).unwrap();
        let resp: RequestVoteResponse = decode_frame(&mut buf.freeze()).unwrap();
        assert_eq!(resp.term, 9);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_entry_roundtrip(
            index in 1u64..u64::MAX,
            term in 1u64..u64::MAX,
            name in "[a-z:]{0,24}",
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let e = LogEntry::new(index, term, name, Bytes::from(payload));
            let mut buf = bytes::BytesMut::new();
            encode_frame(&e, &mut buf).unwrap();
            let (back, consumed) = try_decode_frame::<LogEntry>(&buf).unwrap().unwrap();
            prop_assert_eq!(back, e);
            prop_assert_eq!(consumed, buf.len());
        }

        #[test]
        fn prop_torn_frames_never_decode(
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            cut_frac in 0.0f64..1.0,
        ) {
            let e = LogEntry::new(3, 2, "write", Bytes::from(payload));
            let mut buf = bytes::BytesMut::new();
            encode_frame(&e, &mut buf).unwrap();
            let cut = ((buf.len() as f64) * cut_frac) as usize;
            if cut < buf.len() {
                // Either reported torn or an outright decode error; a torn
                // frame must never round-trip as a full one.
                if let Ok(Some((_, consumed))) = try_decode_frame::<LogEntry>(&buf[..cut]) {
                    prop_assert!(consumed <= cut);
                }
            }
        }
    }
}
