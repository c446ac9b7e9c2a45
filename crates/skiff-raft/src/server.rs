//! The Raft server: public handle plus the single-writer event loop.
//!
//! All mutable consensus state (term, vote, role, peer map, log cursor,
//! pending waiters) is owned by one task. Everything else — incoming RPCs,
//! client submissions, replication acknowledgements, the election timer —
//! reaches it as an [`Event`] through one queue, each RPC carrying a
//! oneshot responder. Replication drivers and vote solicitations run as
//! separate tasks and talk back only through that queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::command::{
    Command, CommandContext, CommandRegistry, JoinCommand, LeaveCommand, MembershipOp,
    JOIN_COMMAND, LEAVE_COMMAND, NOP_COMMAND,
};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::event::ServerEvent;
use crate::log::Log;
use crate::peer::{self, DriverHandle, Peer, ReplicationDriver};
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, RequestVoteRequest,
    RequestVoteResponse, SnapshotRecoveryRequest, SnapshotRecoveryResponse, SnapshotRequest,
    SnapshotResponse,
};
use crate::snapshot::{write_atomic, Snapshot, SnapshotSlot, SnapshotStore, StateMachine};
use crate::transport::Transport;
use crate::types::{PeerInfo, Role};

/// Messages into the server loop.
pub(crate) enum Event {
    AppendEntries {
        req: AppendEntriesRequest,
        tx: oneshot::Sender<AppendEntriesResponse>,
    },
    RequestVote {
        req: RequestVoteRequest,
        tx: oneshot::Sender<RequestVoteResponse>,
    },
    Snapshot {
        req: SnapshotRequest,
        tx: oneshot::Sender<SnapshotResponse>,
    },
    SnapshotRecovery {
        req: SnapshotRecoveryRequest,
        tx: oneshot::Sender<SnapshotRecoveryResponse>,
    },
    Do {
        name: String,
        payload: Bytes,
        tx: oneshot::Sender<Result<Bytes>>,
    },
    VoteResult {
        term: u64,
        from: String,
        resp: RequestVoteResponse,
    },
    PeerAck {
        name: String,
        match_index: u64,
    },
    StepDown {
        term: u64,
    },
    TakeSnapshot {
        tx: oneshot::Sender<Result<()>>,
    },
    Stop {
        tx: oneshot::Sender<()>,
    },
}

/// The `conf` file: everything outside the log that must survive a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Conf {
    commit_index: u64,
    peers: Vec<PeerInfo>,
    term: u64,
    voted_for: Option<String>,
}

#[derive(Clone)]
struct Status {
    role: Role,
    term: u64,
    leader: Option<String>,
    peers: HashMap<String, PeerInfo>,
}

struct Shared {
    name: String,
    connection_string: String,
    config: ServerConfig,
    path: PathBuf,
    log: Log,
    snapshot: SnapshotSlot,
    status: parking_lot::RwLock<Status>,
    events: broadcast::Sender<ServerEvent>,
}

/// Handle to a Raft server. Cheap to clone; all clones address the same
/// underlying event loop.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Event>,
    starter: Arc<parking_lot::Mutex<Option<Core>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    /// Builds a server rooted at `path`, restoring any persisted state.
    ///
    /// An empty `name` loads the identity persisted in `<path>/name`,
    /// generating one (7 hex chars) on first use. The server is created
    /// stopped; call [`Server::start`].
    pub async fn new(
        name: &str,
        path: impl Into<PathBuf>,
        transport: Arc<dyn Transport>,
        machine: Box<dyn StateMachine>,
        config: ServerConfig,
        connection_string: &str,
    ) -> Result<Server> {
        config.validate().map_err(|cause| {
            Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, cause))
        })?;

        let path = path.into();
        fs::create_dir_all(&path).await?;
        let name = resolve_name(&path, name).await?;

        let store = SnapshotStore::open(&path).await?;
        let snapshot = store.load_latest().await?;

        let log = Log::open(&path.join("log")).await?;
        let mut machine = machine;
        if let Some(snap) = &snapshot {
            log.anchor(snap.last_index, snap.last_term).await?;
            machine.recover(&snap.state).map_err(|err| Error::Decode {
                cause: format!("state machine rejected persisted snapshot: {}", err),
            })?;
        }

        let conf = read_conf(&path.join("conf")).await?;
        let initial_peers: Vec<PeerInfo> = conf
            .as_ref()
            .map(|c| c.peers.clone())
            .or_else(|| snapshot.as_ref().map(|s| s.peers.clone()))
            .unwrap_or_default();
        let term = conf.as_ref().map(|c| c.term).unwrap_or(0);
        let voted_for = conf.as_ref().and_then(|c| c.voted_for.clone());
        if let Some(conf) = &conf {
            log.commit(conf.commit_index);
        }

        let peers: HashMap<String, Peer> = initial_peers
            .into_iter()
            .map(|info| (info.name.clone(), Peer::new(info)))
            .collect();

        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            name: name.clone(),
            connection_string: connection_string.to_string(),
            config: config.clone(),
            path,
            log: log.clone(),
            snapshot: Arc::new(parking_lot::RwLock::new(snapshot.clone().map(Arc::new))),
            status: parking_lot::RwLock::new(Status {
                role: Role::Stopped,
                term,
                leader: None,
                peers: peers.values().map(|p| (p.name.clone(), p.info())).collect(),
            }),
            events,
        });

        let (tx, rx) = mpsc::channel(256);
        let core = Core {
            shared: shared.clone(),
            transport,
            machine,
            registry: config.registry.clone(),
            tx: tx.clone(),
            rx: Some(rx),
            store,
            term,
            voted_for,
            role: Role::Stopped,
            leader: None,
            peers,
            drivers: HashMap::new(),
            votes: Vec::new(),
            pending: HashMap::new(),
            last_applied: snapshot.as_ref().map(|s| s.last_index).unwrap_or(0),
            election_deadline: Instant::now(),
            stopping: false,
        };

        Ok(Server {
            shared,
            tx,
            starter: Arc::new(parking_lot::Mutex::new(Some(core))),
        })
    }

    /// Starts the event loop: Initialized, then Follower (or straight to
    /// an election when this server is the whole cluster). Resolves once
    /// persisted state has been replayed into the state machine.
    pub async fn start(&self) -> Result<()> {
        let core = self.starter.lock().take();
        let Some(core) = core else {
            return if self.role() == Role::Stopped {
                Err(Error::StoppedServer)
            } else {
                Ok(())
            };
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(core.run(ready_tx));
        ready_rx.await.map_err(|_| Error::StoppedServer)
    }

    /// Stops the event loop: no new events are accepted, replication
    /// drivers exit, pending submissions fail with `StoppedServer`.
    pub async fn stop(&self) -> Result<()> {
        if self.role() == Role::Stopped {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Event::Stop { tx }).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Submits a command.
    ///
    /// On the leader this blocks until the entry commits and applies
    /// (returning the state machine's result), the leadership is lost, or
    /// the configured deadline passes. Elsewhere it fails immediately with
    /// `NotLeader` carrying the current leader for redirects.
    pub async fn do_command(&self, command: &dyn Command) -> Result<Bytes> {
        let payload = command.serialize()?;
        if self.role() == Role::Stopped {
            return Err(Error::StoppedServer);
        }
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Event::Do {
                name: command.name().to_string(),
                payload,
                tx,
            })
            .await
            .map_err(|_| Error::StoppedServer)?;

        match tokio::time::timeout(self.shared.config.do_timeout, rx).await {
            Err(_) => Err(Error::CommandTimeout),
            Ok(Err(_)) => Err(Error::StoppedServer),
            Ok(Ok(result)) => result,
        }
    }

    /// AppendEntries RPC receiver.
    pub async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.call(|tx| Event::AppendEntries { req, tx }).await
    }

    /// RequestVote RPC receiver.
    pub async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.call(|tx| Event::RequestVote { req, tx }).await
    }

    /// Snapshot-announce RPC receiver.
    pub async fn request_snapshot(&self, req: SnapshotRequest) -> Result<SnapshotResponse> {
        self.call(|tx| Event::Snapshot { req, tx }).await
    }

    /// SnapshotRecovery RPC receiver.
    pub async fn snapshot_recovery_request(
        &self,
        req: SnapshotRecoveryRequest,
    ) -> Result<SnapshotRecoveryResponse> {
        self.call(|tx| Event::SnapshotRecovery { req, tx }).await
    }

    /// Saves a snapshot of the state machine now and compacts the log.
    pub async fn take_snapshot(&self) -> Result<()> {
        self.call(|tx| Event::TakeSnapshot { tx }).await?
    }

    /// Lifecycle notifications; best-effort delivery.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn connection_string(&self) -> &str {
        &self.shared.connection_string
    }

    pub fn role(&self) -> Role {
        self.shared.status.read().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn term(&self) -> u64 {
        self.shared.status.read().term
    }

    pub fn leader(&self) -> Option<String> {
        self.shared.status.read().leader.clone()
    }

    /// Current cluster membership, this server included once joined.
    pub fn peers(&self) -> HashMap<String, PeerInfo> {
        self.shared.status.read().peers.clone()
    }

    pub fn is_log_empty(&self) -> bool {
        self.shared.log.is_empty()
    }

    pub fn max_peer_count(&self) -> usize {
        self.shared.config.max_peer_count
    }

    pub fn commit_index(&self) -> u64 {
        self.shared.log.commit_index()
    }

    async fn call<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Event) -> Result<R> {
        if self.role() == Role::Stopped {
            return Err(Error::StoppedServer);
        }
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| Error::StoppedServer)?;
        rx.await.map_err(|_| Error::StoppedServer)
    }
}

struct Core {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    machine: Box<dyn StateMachine>,
    registry: CommandRegistry,
    tx: mpsc::Sender<Event>,
    rx: Option<mpsc::Receiver<Event>>,
    store: SnapshotStore,

    term: u64,
    voted_for: Option<String>,
    role: Role,
    leader: Option<String>,
    peers: HashMap<String, Peer>,
    drivers: HashMap<String, DriverHandle>,
    votes: Vec<String>,
    pending: HashMap<u64, oneshot::Sender<Result<Bytes>>>,
    last_applied: u64,
    election_deadline: Instant,
    stopping: bool,
}

impl Core {
    async fn run(mut self, ready: oneshot::Sender<()>) {
        let mut rx = self.rx.take().expect("event queue");
        if let Err(err) = self.run_inner(&mut rx, ready).await {
            error!(name = %self.shared.name, %err, "persistence failure, server halting");
        }
        for (_, driver) in self.drivers.drain() {
            driver.stop();
        }
        self.fail_pending(|| Error::StoppedServer);
        self.set_role(Role::Stopped);
        info!(name = %self.shared.name, "server stopped");
    }

    async fn run_inner(
        &mut self,
        rx: &mut mpsc::Receiver<Event>,
        ready: oneshot::Sender<()>,
    ) -> Result<()> {
        self.set_role(Role::Initialized);
        // Committed entries the state machine has not seen yet (everything
        // past the snapshot boundary) are replayed before serving anything.
        self.apply_committed().await?;
        self.set_role(Role::Follower);
        self.reset_election_deadline();
        info!(
            name = %self.shared.name,
            term = self.term,
            commit = self.shared.log.commit_index(),
            "server started"
        );

        // A cluster of one (or a fresh, never-joined server) elects itself
        // without waiting out a timeout.
        if self.cluster_size() <= 1 {
            self.hold_election().await?;
        }
        let _ = ready.send(());

        loop {
            let deadline = self.election_deadline;
            let electable = matches!(self.role, Role::Follower | Role::Candidate);
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    None => break,
                    Some(event) => self.handle(event).await?,
                },
                _ = tokio::time::sleep_until(deadline), if electable => {
                    self.hold_election().await?;
                }
            }
            if self.stopping {
                break;
            }
        }
        Ok(())
    }

    async fn handle(&mut self, event: Event) -> Result<()> {
        match event {
            Event::AppendEntries { req, tx } => {
                let resp = self.on_append_entries(req).await?;
                let _ = tx.send(resp);
            }
            Event::RequestVote { req, tx } => {
                let resp = self.on_request_vote(req).await?;
                let _ = tx.send(resp);
            }
            Event::Snapshot { req, tx } => {
                let resp = self.on_snapshot_request(&req);
                let _ = tx.send(resp);
            }
            Event::SnapshotRecovery { req, tx } => {
                let resp = self.on_snapshot_recovery(req).await?;
                let _ = tx.send(resp);
            }
            Event::Do { name, payload, tx } => {
                self.on_do(name, payload, tx).await?;
            }
            Event::VoteResult { term, from, resp } => {
                self.on_vote_result(term, from, resp).await?;
            }
            Event::PeerAck { name, match_index } => {
                self.on_peer_ack(name, match_index).await?;
            }
            Event::StepDown { term } => {
                if term > self.term {
                    debug!(term, "replication driver observed a newer term");
                    self.adopt_term(term).await?;
                }
            }
            Event::TakeSnapshot { tx } => match self.snapshot_now().await {
                Ok(()) => {
                    let _ = tx.send(Ok(()));
                }
                Err(err) => {
                    let _ = tx.send(Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        err.to_string(),
                    ))));
                    return Err(err);
                }
            },
            Event::Stop { tx } => {
                self.stopping = true;
                self.halt_drivers();
                self.fail_pending(|| Error::StoppedServer);
                self.set_role(Role::Stopped);
                let _ = tx.send(());
            }
        }
        Ok(())
    }

    // ---- RPC receivers -------------------------------------------------

    async fn on_append_entries(
        &mut self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let log = self.shared.log.clone();
        if req.term < self.term {
            trace!(from = %req.leader_name, term = req.term, "rejecting stale append entries");
            return Ok(AppendEntriesResponse {
                term: self.term,
                index: log.last_index(),
                commit_index: log.commit_index(),
                success: false,
            });
        }

        self.adopt_term(req.term).await?;
        if matches!(self.role, Role::Leader | Role::Candidate) {
            if self.role == Role::Leader {
                warn!(
                    term = self.term,
                    from = %req.leader_name,
                    "another leader in our term, stepping down"
                );
            }
            self.step_down_role();
        }
        self.set_leader(Some(req.leader_name.clone()));
        self.reset_election_deadline();

        // Consistency check at the boundary entry.
        let last = log.last_index();
        if req.prev_log_index > last
            || log.term_at(req.prev_log_index) != Some(req.prev_log_term)
        {
            debug!(
                prev_index = req.prev_log_index,
                prev_term = req.prev_log_term,
                our_last = last,
                "append entries boundary mismatch"
            );
            return Ok(AppendEntriesResponse {
                term: self.term,
                index: last,
                commit_index: log.commit_index(),
                success: false,
            });
        }

        // Skip duplicates, cut conflicting suffixes, append the rest.
        let mut append_from = None;
        for (i, entry) in req.entries.iter().enumerate() {
            match log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= log.commit_index() {
                        warn!(
                            index = entry.index,
                            "refusing to truncate committed entries"
                        );
                        return Ok(AppendEntriesResponse {
                            term: self.term,
                            index: log.last_index(),
                            commit_index: log.commit_index(),
                            success: false,
                        });
                    }
                    let boundary = entry.index - 1;
                    let boundary_term =
                        log.term_at(boundary).unwrap_or(req.prev_log_term);
                    log.truncate(boundary, boundary_term).await?;
                    append_from = Some(i);
                    break;
                }
                None => {
                    append_from = Some(i);
                    break;
                }
            }
        }
        if let Some(i) = append_from {
            log.append_entries(req.entries[i..].to_vec()).await?;
        }

        let last = log.last_index();
        let target = req.commit_index.min(last);
        if target > log.commit_index() {
            log.commit(target);
            self.apply_committed().await?;
            self.persist_conf().await?;
        }

        Ok(AppendEntriesResponse {
            term: self.term,
            index: last,
            commit_index: log.commit_index(),
            success: true,
        })
    }

    async fn on_request_vote(&mut self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        if req.term < self.term {
            trace!(from = %req.candidate_name, term = req.term, "refusing stale vote request");
            return Ok(RequestVoteResponse {
                term: self.term,
                vote_granted: false,
            });
        }
        self.adopt_term(req.term).await?;

        let (last_index, last_term) = self.shared.log.last_info();
        let up_to_date = req.last_log_term > last_term
            || (req.last_log_term == last_term && req.last_log_index >= last_index);
        let unspoken = self
            .voted_for
            .as_deref()
            .map_or(true, |voted| voted == req.candidate_name);

        if up_to_date && unspoken {
            self.voted_for = Some(req.candidate_name.clone());
            self.persist_conf().await?;
            self.reset_election_deadline();
            debug!(candidate = %req.candidate_name, term = self.term, "vote granted");
            Ok(RequestVoteResponse {
                term: self.term,
                vote_granted: true,
            })
        } else {
            debug!(
                candidate = %req.candidate_name,
                up_to_date,
                voted_for = ?self.voted_for,
                "vote refused"
            );
            Ok(RequestVoteResponse {
                term: self.term,
                vote_granted: false,
            })
        }
    }

    fn on_snapshot_request(&mut self, req: &SnapshotRequest) -> SnapshotResponse {
        self.reset_election_deadline();
        // If the boundary entry is already in our log the leader can keep
        // using AppendEntries; decline the transfer.
        let have = self.shared.log.term_at(req.last_index) == Some(req.last_term);
        SnapshotResponse { success: !have }
    }

    async fn on_snapshot_recovery(
        &mut self,
        req: SnapshotRecoveryRequest,
    ) -> Result<SnapshotRecoveryResponse> {
        let log = self.shared.log.clone();
        if req.last_index <= log.commit_index() {
            // Stale transfer; everything it covers is already committed here.
            return Ok(SnapshotRecoveryResponse {
                term: self.term,
                success: true,
                commit_index: log.commit_index(),
            });
        }

        self.adopt_term(req.last_term).await?;
        if matches!(self.role, Role::Leader | Role::Candidate) {
            self.step_down_role();
        }
        self.set_leader(Some(req.leader_name.clone()));
        self.reset_election_deadline();

        if let Err(err) = self.machine.recover(&req.state) {
            warn!(%err, "state machine rejected snapshot state");
            return Ok(SnapshotRecoveryResponse {
                term: self.term,
                success: false,
                commit_index: log.commit_index(),
            });
        }

        let peers: Vec<PeerInfo> = req
            .peers
            .iter()
            .map(|p| PeerInfo::new(&p.name, &p.connection_string))
            .collect();
        self.peers = peers
            .iter()
            .map(|info| (info.name.clone(), Peer::new(info.clone())))
            .collect();
        self.sync_peers();

        let snapshot = Snapshot {
            last_index: req.last_index,
            last_term: req.last_term,
            peers,
            state: req.state.clone(),
        };
        self.store.save(&snapshot).await?;
        *self.shared.snapshot.write() = Some(Arc::new(snapshot));

        log.compact(req.last_index, req.last_term).await?;
        log.commit(req.last_index);
        self.last_applied = req.last_index;
        self.persist_conf().await?;

        info!(
            last_index = req.last_index,
            last_term = req.last_term,
            from = %req.leader_name,
            "recovered from leader snapshot"
        );
        Ok(SnapshotRecoveryResponse {
            term: self.term,
            success: true,
            commit_index: log.commit_index(),
        })
    }

    // ---- client path ---------------------------------------------------

    async fn on_do(
        &mut self,
        name: String,
        payload: Bytes,
        tx: oneshot::Sender<Result<Bytes>>,
    ) -> Result<()> {
        if self.role != Role::Leader {
            let _ = tx.send(Err(Error::NotLeader {
                leader: self.leader.clone(),
            }));
            return Ok(());
        }
        if !self.registry.contains(&name) {
            let _ = tx.send(Err(Error::Decode {
                cause: format!("unregistered command: {}", name),
            }));
            return Ok(());
        }
        if let Err(err) = self.precheck_membership(&name, &payload) {
            let _ = tx.send(Err(err));
            return Ok(());
        }

        let log = &self.shared.log;
        let index = log.last_index() + 1;
        let entry = LogEntry::new(index, self.term, name, payload);
        log.append(entry).await?;
        self.pending.insert(index, tx);
        self.kick_drivers();
        self.advance_commit().await
    }

    /// Join/leave sanity checks that run before the command enters the log.
    fn precheck_membership(&self, name: &str, payload: &[u8]) -> Result<()> {
        match name {
            JOIN_COMMAND => {
                let join: JoinCommand = serde_json::from_slice(payload)?;
                if self.peers.contains_key(&join.name) {
                    return Err(Error::DuplicatePeer { name: join.name });
                }
                if self.peers.len() >= self.shared.config.max_peer_count {
                    return Err(Error::AtMaxPeerCount);
                }
            }
            LEAVE_COMMAND => {
                let leave: LeaveCommand = serde_json::from_slice(payload)?;
                if !self.peers.contains_key(&leave.name) {
                    return Err(Error::UnknownPeer { name: leave.name });
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ---- elections -----------------------------------------------------

    async fn hold_election(&mut self) -> Result<()> {
        self.term += 1;
        self.voted_for = Some(self.shared.name.clone());
        self.set_leader(None);
        self.set_role(Role::Candidate);
        self.sync_status();
        let _ = self.shared.events.send(ServerEvent::TermChange { term: self.term });
        self.persist_conf().await?;
        self.reset_election_deadline();

        self.votes = vec![self.shared.name.clone()];
        info!(term = self.term, "election started");
        if self.votes.len() >= self.quorum() {
            return self.become_leader().await;
        }

        let (last_log_index, last_log_term) = self.shared.log.last_info();
        let req = RequestVoteRequest {
            term: self.term,
            last_log_index,
            last_log_term,
            candidate_name: self.shared.name.clone(),
        };
        for peer in self.peers.values() {
            if peer.name == self.shared.name {
                continue;
            }
            let info = peer.info();
            let req = req.clone();
            let transport = self.transport.clone();
            let tx = self.tx.clone();
            tokio::spawn(async move {
                match transport.request_vote(&info, req.clone()).await {
                    Ok(resp) => {
                        let _ = tx
                            .send(Event::VoteResult {
                                term: req.term,
                                from: info.name,
                                resp,
                            })
                            .await;
                    }
                    Err(err) => {
                        trace!(peer = %info.name, %err, "vote request undelivered");
                    }
                }
            });
        }
        Ok(())
    }

    async fn on_vote_result(
        &mut self,
        term: u64,
        from: String,
        resp: RequestVoteResponse,
    ) -> Result<()> {
        if resp.term > self.term {
            return self.adopt_term(resp.term).await;
        }
        if self.role != Role::Candidate || term != self.term || !resp.vote_granted {
            return Ok(());
        }
        if !self.votes.contains(&from) {
            self.votes.push(from);
        }
        if self.votes.len() >= self.quorum() {
            self.become_leader().await?;
        }
        Ok(())
    }

    async fn become_leader(&mut self) -> Result<()> {
        info!(term = self.term, "became leader");
        self.set_role(Role::Leader);
        self.set_leader(Some(self.shared.name.clone()));

        let log = self.shared.log.clone();
        // An entry of this term makes the uncommitted tail inherited from
        // prior terms committable; with nothing outstanding it is not needed.
        if log.last_index() > log.commit_index() {
            let nop = crate::command::NopCommand;
            let entry = LogEntry::new(
                log.last_index() + 1,
                self.term,
                NOP_COMMAND,
                crate::command::Command::serialize(&nop)?,
            );
            log.append(entry).await?;
        }

        let next_index = log.last_index() + 1;
        let names: Vec<String> = self.peers.keys().cloned().collect();
        for name in names {
            if let Some(peer) = self.peers.get_mut(&name) {
                peer.next_index = next_index;
                peer.match_index = 0;
            }
            if name != self.shared.name {
                self.spawn_driver(&name);
            }
        }
        self.advance_commit().await
    }

    // ---- replication bookkeeping --------------------------------------

    fn spawn_driver(&mut self, name: &str) {
        let Some(peer) = self.peers.get(name) else { return };
        if self.drivers.contains_key(name) {
            return;
        }
        let (halt_tx, halt_rx) = watch::channel(false);
        let kick = Arc::new(Notify::new());
        let driver = ReplicationDriver {
            peer: peer.info(),
            leader: self.shared.name.clone(),
            term: self.term,
            log: self.shared.log.clone(),
            snapshot: self.shared.snapshot.clone(),
            transport: self.transport.clone(),
            server_tx: self.tx.clone(),
            kick: kick.clone(),
            halt: halt_rx,
            heartbeat_interval: self.shared.config.heartbeat_interval,
            max_entries: self.shared.config.max_log_entries_per_request,
            max_bytes: self.shared.config.max_append_bytes,
            next_index: self.shared.log.last_index() + 1,
        };
        tokio::spawn(peer::run(driver));
        self.drivers
            .insert(name.to_string(), DriverHandle { kick, halt: halt_tx });
    }

    fn kick_drivers(&self) {
        for driver in self.drivers.values() {
            driver.kick.notify_one();
        }
    }

    fn halt_drivers(&mut self) {
        for (_, driver) in self.drivers.drain() {
            driver.stop();
        }
    }

    async fn on_peer_ack(&mut self, name: String, match_index: u64) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let Some(peer) = self.peers.get_mut(&name) else {
            return Ok(());
        };
        if match_index > peer.match_index {
            peer.match_index = match_index;
            peer.next_index = match_index + 1;
        }
        peer.last_activity = Some(std::time::Instant::now());
        self.advance_commit().await
    }

    /// Figure-8 safe commit advancement: the highest index replicated on a
    /// quorum counts only if the entry there carries the current term.
    async fn advance_commit(&mut self) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let log = self.shared.log.clone();
        let last = log.last_index();

        let mut matches: Vec<u64> = Vec::with_capacity(self.cluster_size());
        for peer in self.peers.values() {
            matches.push(if peer.name == self.shared.name {
                last
            } else {
                peer.match_index
            });
        }
        if !self.peers.contains_key(&self.shared.name) {
            matches.push(last);
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matches[self.quorum() - 1];

        if candidate > log.commit_index() && log.term_at(candidate) == Some(self.term) {
            log.commit(candidate);
            trace!(commit = candidate, "commit index advanced");
            self.apply_committed().await?;
            self.persist_conf().await?;
            self.kick_drivers();
        }
        Ok(())
    }

    // ---- apply path ----------------------------------------------------

    async fn apply_committed(&mut self) -> Result<()> {
        let log = self.shared.log.clone();
        while self.last_applied < log.commit_index() && !self.stopping {
            let index = self.last_applied + 1;
            let Some(entry) = log.range(index, index).pop() else {
                // Compaction moved past us; the snapshot already holds this
                // state.
                self.last_applied = log.base_index();
                continue;
            };
            let result = self.apply_entry(&entry).await?;
            self.last_applied = index;
            match self.pending.remove(&index) {
                Some(waiter) => {
                    let _ = waiter.send(result);
                }
                None => {
                    if let Err(err) = result {
                        warn!(index, %err, "committed command failed to apply");
                    }
                }
            }
        }

        if self.last_applied - self.shared.log.base_index()
            >= self.shared.config.snapshot_threshold
        {
            self.snapshot_now().await?;
        }
        Ok(())
    }

    /// Decodes and applies one committed entry; membership side effects are
    /// enacted before the waiter sees the result. The outer `Result` is
    /// fatal persistence failure; the inner one is the command's own.
    async fn apply_entry(&mut self, entry: &LogEntry) -> Result<Result<Bytes>> {
        let command = match self.registry.decode(&entry.command_name, &entry.command) {
            Ok(command) => command,
            Err(err) => {
                warn!(
                    index = entry.index,
                    name = %entry.command_name,
                    "cannot decode committed command"
                );
                return Ok(Err(err));
            }
        };
        let mut ctx = CommandContext::new(self.machine.as_mut());
        let result = command.apply(&mut ctx);
        let ops = std::mem::take(&mut ctx.membership);
        for op in ops {
            self.enact(op).await?;
        }
        Ok(result)
    }

    async fn enact(&mut self, op: MembershipOp) -> Result<()> {
        match op {
            MembershipOp::Add(info) => {
                let name = info.name.clone();
                let fresh = !self.peers.contains_key(&name);
                self.peers.insert(name.clone(), Peer::new(info));
                self.sync_peers();
                self.persist_conf().await?;
                if fresh {
                    info!(peer = %name, "peer joined");
                    let _ = self
                        .shared
                        .events
                        .send(ServerEvent::PeerAdded { name: name.clone() });
                }
                if self.role == Role::Leader && name != self.shared.name {
                    self.spawn_driver(&name);
                }
            }
            MembershipOp::Remove(name) => {
                if self.peers.remove(&name).is_some() {
                    info!(peer = %name, "peer left");
                    let _ = self
                        .shared
                        .events
                        .send(ServerEvent::PeerRemoved { name: name.clone() });
                }
                if let Some(driver) = self.drivers.remove(&name) {
                    driver.stop();
                }
                self.sync_peers();
                self.persist_conf().await?;
                if name == self.shared.name {
                    info!("own leave committed, stopping");
                    self.stopping = true;
                }
            }
        }
        Ok(())
    }

    // ---- snapshots -----------------------------------------------------

    async fn snapshot_now(&mut self) -> Result<()> {
        let log = self.shared.log.clone();
        if self.last_applied <= log.base_index() {
            return Ok(());
        }
        let prior = self.role;
        self.set_role(Role::Snapshotting);

        let state = self.machine.save()?;
        let last_term = log.term_at(self.last_applied).unwrap_or(self.term);
        let mut peers: Vec<PeerInfo> = self.peers.values().map(Peer::info).collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        let snapshot = Snapshot {
            last_index: self.last_applied,
            last_term,
            peers,
            state: state.into(),
        };
        self.store.save(&snapshot).await?;
        let last_index = snapshot.last_index;
        *self.shared.snapshot.write() = Some(Arc::new(snapshot));
        log.compact(last_index, last_term).await?;

        self.set_role(prior);
        info!(last_index, last_term, "snapshot taken, log compacted");
        Ok(())
    }

    // ---- state transitions ---------------------------------------------

    async fn adopt_term(&mut self, term: u64) -> Result<()> {
        if term <= self.term {
            return Ok(());
        }
        if matches!(self.role, Role::Leader | Role::Candidate) {
            self.step_down_role();
        }
        self.term = term;
        self.voted_for = None;
        self.set_leader(None);
        self.sync_status();
        let _ = self.shared.events.send(ServerEvent::TermChange { term });
        self.persist_conf().await
    }

    /// Leader/candidate falls back to follower within the current term.
    fn step_down_role(&mut self) {
        self.halt_drivers();
        self.votes.clear();
        self.fail_pending(|| Error::LostLeadership);
        self.set_role(Role::Follower);
    }

    fn fail_pending(&mut self, err: impl Fn() -> Error) {
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(err()));
        }
    }

    fn set_role(&mut self, to: Role) {
        if self.role == to {
            return;
        }
        let from = self.role;
        self.role = to;
        self.sync_status();
        debug!(name = %self.shared.name, %from, %to, "role changed");
        let _ = self
            .shared
            .events
            .send(ServerEvent::StateChange { from, to });
    }

    fn set_leader(&mut self, leader: Option<String>) {
        if self.leader == leader {
            return;
        }
        self.leader = leader.clone();
        self.sync_status();
        let _ = self.shared.events.send(ServerEvent::LeaderChange { leader });
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline =
            Instant::now() + self.shared.config.random_election_timeout();
    }

    fn cluster_size(&self) -> usize {
        let mut n = self.peers.len();
        if !self.peers.contains_key(&self.shared.name) {
            n += 1;
        }
        n
    }

    fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    fn sync_status(&self) {
        let mut status = self.shared.status.write();
        status.role = self.role;
        status.term = self.term;
        status.leader = self.leader.clone();
    }

    fn sync_peers(&self) {
        let mut status = self.shared.status.write();
        status.peers = self
            .peers
            .values()
            .map(|p| (p.name.clone(), p.info()))
            .collect();
    }

    async fn persist_conf(&self) -> Result<()> {
        let mut peers: Vec<PeerInfo> = self.peers.values().map(Peer::info).collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        let conf = Conf {
            commit_index: self.shared.log.commit_index(),
            peers,
            term: self.term,
            voted_for: self.voted_for.clone(),
        };
        write_atomic(&self.shared.path.join("conf"), &serde_json::to_vec(&conf)?).await
    }
}

async fn read_conf(path: &Path) -> Result<Option<Conf>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Loads or mints the server's stable identity in `<path>/name`.
async fn resolve_name(path: &Path, given: &str) -> Result<String> {
    let name_path = path.join("name");
    if !given.is_empty() {
        if fs::metadata(&name_path).await.is_err() {
            fs::write(&name_path, given).await?;
        }
        return Ok(given.to_string());
    }
    match fs::read_to_string(&name_path).await {
        Ok(existing) if !existing.trim().is_empty() => Ok(existing.trim().to_string()),
        Ok(_) | Err(_) => {
            let generated = generate_name();
            fs::write(&name_path, &generated).await?;
            Ok(generated)
        }
    }
}

fn generate_name() -> String {
    use rand::Rng;
    format!("{:07x}", rand::thread_rng().gen_range(0u64..0x1000_0000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::JoinCommand;
    use crate::transport::MemoryHub;
    use std::any::Any;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct NullMachine;

    impl StateMachine for NullMachine {
        fn save(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn recover(&mut self, _state: &[u8]) -> Result<()> {
            Ok(())
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    async fn new_server(dir: &TempDir, hub: &MemoryHub, name: &str) -> Server {
        let server = Server::new(
            name,
            dir.path().join(name),
            hub.transport(name),
            Box::new(NullMachine),
            ServerConfig::default(),
            &format!("mem://{}", name),
        )
        .await
        .unwrap();
        hub.register(&server);
        server
    }

    #[tokio::test]
    async fn stopped_server_refuses_everything() {
        let dir = TempDir::new().unwrap();
        let hub = MemoryHub::new();
        let server = new_server(&dir, &hub, "n1").await;

        assert_eq!(server.role(), Role::Stopped);
        let err = server
            .request_vote(RequestVoteRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoppedServer));
        let err = server.do_command(&JoinCommand::new("n1", "mem://n1")).await;
        assert!(matches!(err, Err(Error::StoppedServer)));
    }

    #[tokio::test]
    async fn single_node_bootstrap() {
        let dir = TempDir::new().unwrap();
        let hub = MemoryHub::new();
        let server = new_server(&dir, &hub, "n1").await;

        server.start().await.unwrap();
        assert_eq!(server.role(), Role::Leader);
        assert_eq!(server.term(), 1);

        server
            .do_command(&JoinCommand::new("n1", "mem://n1"))
            .await
            .unwrap();
        assert_eq!(server.commit_index(), 1);
        assert!(!server.is_log_empty());
        assert!(server.peers().contains_key("n1"));

        server.stop().await.unwrap();
        assert_eq!(server.role(), Role::Stopped);
    }

    #[tokio::test]
    async fn join_prechecks() {
        let dir = TempDir::new().unwrap();
        let hub = MemoryHub::new();
        let server = new_server(&dir, &hub, "n1").await;
        server.start().await.unwrap();

        server
            .do_command(&JoinCommand::new("n1", "mem://n1"))
            .await
            .unwrap();

        let err = server
            .do_command(&JoinCommand::new("n1", "mem://n1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicatePeer { .. }));

        let err = server
            .do_command(&crate::command::LeaveCommand::new("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPeer { .. }));
    }

    #[tokio::test]
    async fn name_is_stable_across_restarts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("srv");
        let hub = MemoryHub::new();

        let first = Server::new(
            "",
            &path,
            hub.transport("x"),
            Box::new(NullMachine),
            ServerConfig::default(),
            "mem://x",
        )
        .await
        .unwrap();
        let name = first.name().to_string();
        assert!(name.len() >= 7);
        drop(first);

        let second = Server::new(
            "",
            &path,
            hub.transport("x"),
            Box::new(NullMachine),
            ServerConfig::default(),
            "mem://x",
        )
        .await
        .unwrap();
        assert_eq!(second.name(), name);
    }

    #[tokio::test]
    async fn restart_recovers_term_log_and_peers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("srv");
        let hub = MemoryHub::new();

        {
            let server = Server::new(
                "n1",
                &path,
                hub.transport("n1"),
                Box::new(NullMachine),
                ServerConfig::default(),
                "mem://n1",
            )
            .await
            .unwrap();
            server.start().await.unwrap();
            server
                .do_command(&JoinCommand::new("n1", "mem://n1"))
                .await
                .unwrap();
            server.stop().await.unwrap();
        }

        let server = Server::new(
            "n1",
            &path,
            hub.transport("n1"),
            Box::new(NullMachine),
            ServerConfig::default(),
            "mem://n1",
        )
        .await
        .unwrap();
        assert!(server.term() >= 1);
        assert!(!server.is_log_empty());
        server.start().await.unwrap();
        assert!(server.peers().contains_key("n1"));
        assert_eq!(server.commit_index(), 1);
    }
}
