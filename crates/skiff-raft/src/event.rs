//! Server lifecycle notifications.

use crate::types::Role;

/// Broadcast to subscribers of [`crate::Server::events`]. Delivery is
/// best-effort: a lagging subscriber misses events rather than applying
/// backpressure to the server loop.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Role transition.
    StateChange { from: Role, to: Role },
    /// The known leader changed (None while an election is unresolved).
    LeaderChange { leader: Option<String> },
    /// The current term advanced.
    TermChange { term: u64 },
    /// A join command committed.
    PeerAdded { name: String },
    /// A leave command committed.
    PeerRemoved { name: String },
}
