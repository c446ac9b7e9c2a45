//! Transport abstraction for the four RPCs, plus an in-memory transport
//! for tests.
//!
//! The server core never talks to the network directly; it hands requests
//! to a [`Transport`] and interprets `Err(Error::Transport)` as
//! "unreachable". The transport provides no retries and no cross-RPC
//! ordering; replication drivers own retry policy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    SnapshotRecoveryRequest, SnapshotRecoveryResponse, SnapshotRequest, SnapshotResponse,
};
use crate::server::Server;
use crate::types::PeerInfo;

/// Carries RPCs to one peer at a time.
///
/// Implementations resolve `peer.connection_string` to an address, send the
/// encoded request, and decode the response. They must not block the caller
/// beyond their configured response timeout.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn append_entries(
        &self,
        peer: &PeerInfo,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn request_vote(
        &self,
        peer: &PeerInfo,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn snapshot(&self, peer: &PeerInfo, req: SnapshotRequest) -> Result<SnapshotResponse>;

    async fn snapshot_recovery(
        &self,
        peer: &PeerInfo,
        req: SnapshotRecoveryRequest,
    ) -> Result<SnapshotRecoveryResponse>;
}

#[derive(Default)]
struct HubInner {
    servers: HashMap<String, Server>,
    /// Directed severed links `(from, to)`.
    severed: HashSet<(String, String)>,
}

/// Routing table shared by every [`MemoryTransport`] in a test cluster.
///
/// Links can be severed and healed to simulate partitions for leader-crash
/// and split-vote scenarios.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<RwLock<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `server` reachable under its name.
    pub fn register(&self, server: &Server) {
        self.inner
            .write()
            .servers
            .insert(server.name().to_string(), server.clone());
    }

    pub fn deregister(&self, name: &str) {
        self.inner.write().servers.remove(name);
    }

    /// Builds the transport endpoint for `local`.
    pub fn transport(&self, local: impl Into<String>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            local: local.into(),
            hub: self.clone(),
        })
    }

    /// Cuts the link between `a` and `b` in both directions.
    pub fn sever(&self, a: &str, b: &str) {
        let mut inner = self.inner.write();
        inner.severed.insert((a.to_string(), b.to_string()));
        inner.severed.insert((b.to_string(), a.to_string()));
    }

    /// Restores the link between `a` and `b`.
    pub fn heal(&self, a: &str, b: &str) {
        let mut inner = self.inner.write();
        inner.severed.remove(&(a.to_string(), b.to_string()));
        inner.severed.remove(&(b.to_string(), a.to_string()));
    }

    /// Cuts `name` off from every registered server.
    pub fn isolate(&self, name: &str) {
        let mut inner = self.inner.write();
        let others: Vec<String> = inner
            .servers
            .keys()
            .filter(|other| other.as_str() != name)
            .cloned()
            .collect();
        for other in others {
            inner.severed.insert((name.to_string(), other.clone()));
            inner.severed.insert((other, name.to_string()));
        }
    }

    /// Undoes [`MemoryHub::isolate`].
    pub fn rejoin(&self, name: &str) {
        self.inner
            .write()
            .severed
            .retain(|(from, to)| from != name && to != name);
    }

    fn route(&self, from: &str, to: &str) -> Result<Server> {
        let inner = self.inner.read();
        if inner.severed.contains(&(from.to_string(), to.to_string())) {
            return Err(Error::transport(format!("link severed: {} -> {}", from, to)));
        }
        inner
            .servers
            .get(to)
            .cloned()
            .ok_or_else(|| Error::transport(format!("peer unreachable: {}", to)))
    }
}

/// In-process transport delivering RPCs straight into the target server's
/// event queue.
pub struct MemoryTransport {
    local: String,
    hub: MemoryHub,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn append_entries(
        &self,
        peer: &PeerInfo,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let target = self.hub.route(&self.local, &peer.name)?;
        target.append_entries(req).await
    }

    async fn request_vote(
        &self,
        peer: &PeerInfo,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let target = self.hub.route(&self.local, &peer.name)?;
        target.request_vote(req).await
    }

    async fn snapshot(&self, peer: &PeerInfo, req: SnapshotRequest) -> Result<SnapshotResponse> {
        let target = self.hub.route(&self.local, &peer.name)?;
        target.request_snapshot(req).await
    }

    async fn snapshot_recovery(
        &self,
        peer: &PeerInfo,
        req: SnapshotRecoveryRequest,
    ) -> Result<SnapshotRecoveryResponse> {
        let target = self.hub.route(&self.local, &peer.name)?;
        target.snapshot_recovery_request(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let hub = MemoryHub::new();
        let transport = hub.transport("n1");
        let peer = PeerInfo::new("ghost", "mem://ghost");

        let err = transport
            .request_vote(&peer, RequestVoteRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[test]
    fn sever_and_heal_bookkeeping() {
        let hub = MemoryHub::new();
        hub.sever("a", "b");
        assert!(hub.route("a", "b").is_err());
        assert!(hub.route("b", "a").is_err());

        hub.heal("a", "b");
        // Link restored; failure now comes from the peer being unregistered.
        let err = hub.route("a", "b").unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }
}
