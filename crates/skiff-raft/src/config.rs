//! Server configuration (timeouts, limits, command registry).

use std::time::Duration;

use crate::command::CommandRegistry;

/// Tuning knobs for a server.
///
/// The defaults mirror the classic Raft paper ratios: heartbeats an order of
/// magnitude more frequent than election timeouts, election timeouts
/// randomized per term.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Base election timeout. The per-term deadline is randomized in
    /// `[election_timeout, 2 * election_timeout]`.
    ///
    /// Default: 150ms.
    pub election_timeout: Duration,

    /// Interval at which each replication driver contacts its follower,
    /// entries or not. Must be well below `election_timeout`.
    ///
    /// Default: 50ms.
    pub heartbeat_interval: Duration,

    /// Maximum entries per AppendEntries request.
    ///
    /// Default: 64.
    pub max_log_entries_per_request: usize,

    /// Soft cap on the encoded size of entries per AppendEntries request.
    /// A batch stops growing once it crosses this, so a single oversized
    /// entry still ships alone.
    ///
    /// Default: 1 MiB.
    pub max_append_bytes: usize,

    /// Number of applied entries since the last snapshot that triggers a
    /// local snapshot and log compaction.
    ///
    /// Default: 20,000.
    pub snapshot_threshold: u64,

    /// Maximum cluster size; joins beyond this are refused before they
    /// reach the log.
    ///
    /// Default: 9.
    pub max_peer_count: usize,

    /// How long a submitted command may wait for commit and apply before
    /// failing with `CommandTimeout`.
    ///
    /// Default: 5s.
    pub do_timeout: Duration,

    /// Decoders for every command name this cluster replicates. All members
    /// must share the same registrations or applied state diverges.
    pub registry: CommandRegistry,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(50),
            max_log_entries_per_request: 64,
            max_append_bytes: 1024 * 1024,
            snapshot_threshold: 20_000,
            max_peer_count: 9,
            do_timeout: Duration::from_secs(5),
            registry: CommandRegistry::new(),
        }
    }
}

impl ServerConfig {
    /// Validates invariants between the knobs.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval >= self.election_timeout {
            return Err(format!(
                "heartbeat_interval ({:?}) must be < election_timeout ({:?})",
                self.heartbeat_interval, self.election_timeout
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be > 0".into());
        }
        if self.max_log_entries_per_request == 0 {
            return Err("max_log_entries_per_request must be > 0".into());
        }
        if self.max_peer_count == 0 {
            return Err("max_peer_count must be > 0".into());
        }
        Ok(())
    }

    /// Randomized election deadline for one term, uniform in
    /// `[election_timeout, 2 * election_timeout]`.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min = self.election_timeout.as_millis() as u64;
        let ms = rand::thread_rng().gen_range(min..=min * 2);
        Duration::from_millis(ms)
    }
}
