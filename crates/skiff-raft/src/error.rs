//! Error types.

use thiserror::Error;

/// Errors surfaced by the server, log, and transport layers.
#[derive(Error, Debug)]
pub enum Error {
    /// The operation requires the leader; redirect to `leader` if known.
    #[error("not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<String> },

    /// The server is stopped and refuses further events.
    #[error("server is stopped")]
    StoppedServer,

    /// A peer with this name is already part of the cluster.
    #[error("duplicate peer: {name}")]
    DuplicatePeer { name: String },

    /// No peer with this name is part of the cluster.
    #[error("unknown peer: {name}")]
    UnknownPeer { name: String },

    /// The cluster already holds the configured maximum number of peers.
    #[error("cluster is at maximum peer count")]
    AtMaxPeerCount,

    /// A message carried a term lower than ours.
    #[error("stale term (ours: {ours}, theirs: {theirs})")]
    StaleTerm { ours: u64, theirs: u64 },

    /// The log refused an operation because the entry at `at_index` does not
    /// carry `expected_term`, or the operation would cross the commit index.
    #[error("log mismatch at index {at_index} (expected term {expected_term})")]
    LogMismatch { expected_term: u64, at_index: u64 },

    /// A submitted command did not commit before the deadline.
    #[error("command timed out before commit")]
    CommandTimeout,

    /// Leadership was lost while a submitted command was in flight.
    #[error("lost leadership before command committed")]
    LostLeadership,

    /// The transport could not reach the peer. Never fatal; replication
    /// drivers retry with backoff.
    #[error("transport: {cause}")]
    Transport { cause: String },

    /// Persistence I/O failure. Fatal to the server.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Wire or payload decoding failure.
    #[error("decode: {cause}")]
    Decode { cause: String },
}

impl Error {
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        Error::Transport {
            cause: cause.to_string(),
        }
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::Decode {
            cause: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode {
            cause: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
