//! Leader-side replication: per-follower state and the driver task.
//!
//! While a server is leader it runs one driver task per other member. The
//! driver owns that follower's `next_index`, sends AppendEntries on every
//! heartbeat interval (or sooner, when kicked), backs off on log
//! inconsistency, and falls back to snapshot transfer when the follower
//! trails the compaction boundary. Progress reaches the server loop only as
//! [`Event::PeerAck`] / [`Event::StepDown`] messages; the driver holds no
//! server state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, trace, warn};

use crate::log::{Log, Tail};
use crate::proto::{AppendEntriesRequest, SnapshotPeer, SnapshotRecoveryRequest, SnapshotRequest};
use crate::server::Event;
use crate::snapshot::SnapshotSlot;
use crate::transport::Transport;
use crate::types::PeerInfo;

/// The server's record of one cluster member. The entry for the server
/// itself is inert; replication state only ever changes from that member's
/// own responses.
#[derive(Debug, Clone)]
pub struct Peer {
    pub name: String,
    pub connection_string: String,
    /// Next index the leader will send this peer.
    pub next_index: u64,
    /// Highest index known replicated on this peer.
    pub match_index: u64,
    /// Last time this peer acknowledged anything.
    pub last_activity: Option<Instant>,
}

impl Peer {
    pub fn new(info: PeerInfo) -> Self {
        Self {
            name: info.name,
            connection_string: info.connection_string,
            next_index: 1,
            match_index: 0,
            last_activity: None,
        }
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo::new(&self.name, &self.connection_string)
    }
}

/// Control handles the server loop keeps per running driver.
pub(crate) struct DriverHandle {
    pub kick: Arc<Notify>,
    pub halt: watch::Sender<bool>,
}

impl DriverHandle {
    pub fn stop(&self) {
        let _ = self.halt.send(true);
        self.kick.notify_one();
    }
}

/// One follower's replication loop. Alive for at most one leadership term;
/// the term is fixed at spawn.
pub(crate) struct ReplicationDriver {
    pub peer: PeerInfo,
    pub leader: String,
    pub term: u64,
    pub log: Log,
    pub snapshot: SnapshotSlot,
    pub transport: Arc<dyn Transport>,
    pub server_tx: mpsc::Sender<Event>,
    pub kick: Arc<Notify>,
    pub halt: watch::Receiver<bool>,
    pub heartbeat_interval: Duration,
    pub max_entries: usize,
    pub max_bytes: usize,
    pub next_index: u64,
}

pub(crate) async fn run(mut driver: ReplicationDriver) {
    trace!(peer = %driver.peer.name, term = driver.term, "replication driver started");
    // First contact goes out immediately so a fresh leader asserts itself
    // within one round trip.
    let mut immediate = true;
    loop {
        if !immediate {
            let mut halt = driver.halt.clone();
            tokio::select! {
                _ = tokio::time::sleep(driver.heartbeat_interval) => {}
                _ = driver.kick.notified() => {}
                _ = halt.changed() => {}
            }
        }
        if *driver.halt.borrow() {
            break;
        }
        immediate = false;

        match driver.round().await {
            Flow::Continue => {}
            Flow::Again => immediate = true,
            Flow::Halt => break,
        }
    }
    trace!(peer = %driver.peer.name, "replication driver exited");
}

enum Flow {
    /// Wait for the next heartbeat tick or kick.
    Continue,
    /// More work is queued; go again without waiting.
    Again,
    /// The driver's leadership is over.
    Halt,
}

impl ReplicationDriver {
    async fn round(&mut self) -> Flow {
        match self.log.entries_after(
            self.next_index - 1,
            self.max_entries,
            self.max_bytes,
        ) {
            Tail::Compacted => self.install_snapshot().await,
            Tail::Entries { entries, prev_term } => {
                self.append_round(entries, prev_term).await
            }
        }
    }

    async fn append_round(&mut self, entries: Vec<crate::proto::LogEntry>, prev_term: u64) -> Flow {
        let prev_index = self.next_index - 1;
        let sent = entries.len() as u64;
        let full_batch = entries.len() == self.max_entries;

        let req = AppendEntriesRequest {
            term: self.term,
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            commit_index: self.log.commit_index(),
            leader_name: self.leader.clone(),
            entries,
        };

        let resp = match self.transport.append_entries(&self.peer, req).await {
            Ok(resp) => resp,
            Err(err) => {
                trace!(peer = %self.peer.name, %err, "append entries undelivered");
                return Flow::Continue;
            }
        };

        if resp.term > self.term {
            debug!(peer = %self.peer.name, term = resp.term, "peer is ahead, stepping down");
            let _ = self
                .server_tx
                .send(Event::StepDown { term: resp.term })
                .await;
            return Flow::Halt;
        }

        if resp.success {
            let match_index = prev_index + sent;
            self.next_index = match_index + 1;
            if self
                .server_tx
                .send(Event::PeerAck {
                    name: self.peer.name.clone(),
                    match_index,
                })
                .await
                .is_err()
            {
                return Flow::Halt;
            }
            if full_batch {
                Flow::Again
            } else {
                Flow::Continue
            }
        } else {
            // Log inconsistency. The follower reported its last index, so
            // jump straight past any gap instead of walking back one entry
            // per round trip; never below 1. Falling at or below the
            // compaction boundary flips the next round into snapshot
            // transfer.
            let backed = self.next_index.saturating_sub(1).min(resp.index + 1).max(1);
            debug!(
                peer = %self.peer.name,
                from = self.next_index,
                to = backed,
                "follower log diverges, backing off"
            );
            if backed == self.next_index {
                return Flow::Continue;
            }
            self.next_index = backed;
            Flow::Again
        }
    }

    /// Sends the live snapshot: an announce RPC, then the recovery RPC with
    /// the full image. AppendEntries stays paused until this resolves.
    async fn install_snapshot(&mut self) -> Flow {
        let snapshot = self.snapshot.read().clone();
        let Some(snapshot) = snapshot else {
            // Compacted log without a snapshot only happens mid-startup.
            warn!(peer = %self.peer.name, "follower needs a snapshot but none is loaded");
            return Flow::Continue;
        };

        let announce = SnapshotRequest {
            leader_name: self.leader.clone(),
            last_index: snapshot.last_index,
            last_term: snapshot.last_term,
        };
        match self.transport.snapshot(&self.peer, announce).await {
            Ok(resp) if !resp.success => {
                // Follower already holds the boundary entry; resume normal
                // replication right after it.
                self.next_index = snapshot.last_index + 1;
                return Flow::Again;
            }
            Ok(_) => {}
            Err(err) => {
                trace!(peer = %self.peer.name, %err, "snapshot announce undelivered");
                return Flow::Continue;
            }
        }

        let recovery = SnapshotRecoveryRequest {
            leader_name: self.leader.clone(),
            last_index: snapshot.last_index,
            last_term: snapshot.last_term,
            peers: snapshot
                .peers
                .iter()
                .map(|p| SnapshotPeer {
                    name: p.name.clone(),
                    connection_string: p.connection_string.clone(),
                })
                .collect(),
            state: snapshot.state.clone(),
        };
        match self.transport.snapshot_recovery(&self.peer, recovery).await {
            Ok(resp) => {
                if resp.term > self.term {
                    let _ = self
                        .server_tx
                        .send(Event::StepDown { term: resp.term })
                        .await;
                    return Flow::Halt;
                }
                if resp.success {
                    debug!(
                        peer = %self.peer.name,
                        last_index = snapshot.last_index,
                        "snapshot installed"
                    );
                    self.next_index = snapshot.last_index + 1;
                    if self
                        .server_tx
                        .send(Event::PeerAck {
                            name: self.peer.name.clone(),
                            match_index: snapshot.last_index,
                        })
                        .await
                        .is_err()
                    {
                        return Flow::Halt;
                    }
                    Flow::Again
                } else {
                    warn!(peer = %self.peer.name, "peer rejected snapshot recovery");
                    Flow::Continue
                }
            }
            Err(err) => {
                trace!(peer = %self.peer.name, %err, "snapshot recovery undelivered");
                Flow::Continue
            }
        }
    }
}
