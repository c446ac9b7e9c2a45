//! Core identifiers: roles and peer descriptors.
//!
//! Terms and log indices travel as plain `u64`s, matching the wire
//! encoding: terms partition time into election epochs (a larger term
//! always supersedes a smaller one) and indices are dense and 1-based,
//! with 0 the sentinel for "before the log".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Server role.
///
/// `Stopped` and `Initialized` bracket the lifecycle; `Snapshotting` is a
/// transient state entered while a local snapshot is being saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Stopped,
    Initialized,
    Follower,
    Candidate,
    Leader,
    Snapshotting,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Stopped => "stopped",
            Role::Initialized => "initialized",
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
            Role::Snapshotting => "snapshotting",
        };
        f.write_str(s)
    }
}

/// A cluster member as known to every server: stable name plus the
/// connection string the transport resolves to an address.
///
/// Serialized into the `conf` file and snapshot metadata with the field
/// casing of the on-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerInfo {
    pub name: String,
    pub connection_string: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>, connection_string: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_string: connection_string.into(),
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.connection_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_display() {
        assert_eq!(Role::Follower.to_string(), "follower");
        assert_eq!(Role::Snapshotting.to_string(), "snapshotting");
    }

    #[test]
    fn peer_info_json_casing() {
        let peer = PeerInfo::new("a1b2c3d", "http://localhost:4001");
        let json = serde_json::to_string(&peer).unwrap();
        assert!(json.contains("\"Name\""));
        assert!(json.contains("\"ConnectionString\""));
        let back: PeerInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer);
    }
}
