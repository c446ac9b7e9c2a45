//! skiff-raft: a replicated state machine built on the Raft consensus
//! protocol.
//!
//! A fixed-membership cluster of peers agrees on a linearly ordered log of
//! application commands, applies them to a deterministic state machine, and
//! survives crashes of a minority of peers. The crate provides:
//!
//! - Leader election with randomized timeouts
//! - A durable, append-only log with crash salvage and fsynced appends
//! - The AppendEntries replication pipeline with per-follower drivers
//! - Snapshotting, log compaction, and follower catch-up via snapshot
//!   transfer
//! - Single-peer join/leave membership commands replicated through the log
//!
//! Transports are pluggable through the [`Transport`] trait; an in-memory
//! implementation ships for tests. Application state plugs in through
//! [`StateMachine`] and [`Command`].
//!
//! Based on the Raft paper (Ongaro & Ousterhout, 2014).

pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod log;
pub mod peer;
pub mod proto;
pub mod server;
pub mod snapshot;
pub mod transport;
pub mod types;

pub use command::{Command, CommandContext, CommandRegistry, JoinCommand, LeaveCommand, NopCommand};
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use event::ServerEvent;
pub use server::Server;
pub use snapshot::{Snapshot, StateMachine};
pub use transport::{MemoryHub, MemoryTransport, Transport};
pub use types::{PeerInfo, Role};
