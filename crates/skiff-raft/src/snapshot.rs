//! Snapshots: a compacted log prefix plus the state-machine image.
//!
//! A snapshot is two files under `snapshot/`: `<term>_<index>.ss` holds the
//! opaque state blob and `<term>_<index>.meta` holds JSON metadata (last
//! included index/term and the peer set at that point). Both are written to
//! a `.tmp` sibling and renamed; the metadata is renamed last, so a snapshot
//! is live only once its metadata is. Older pairs are removed after the new
//! pair is durable.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::Result;
use crate::types::PeerInfo;

/// Application state machine capability.
///
/// `save` and `recover` must be deterministic: two machines that applied
/// the same committed prefix produce interchangeable images.
pub trait StateMachine: Send + Sync + 'static {
    /// Serializes the current state for a snapshot.
    fn save(&self) -> Result<Vec<u8>>;

    /// Replaces the current state with a saved image.
    fn recover(&mut self, state: &[u8]) -> Result<()>;

    /// Escape hatch so typed commands can reach the concrete machine.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A snapshot at `last_index`/`last_term`, superseding all log entries at
/// or below `last_index`.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub last_index: u64,
    pub last_term: u64,
    pub peers: Vec<PeerInfo>,
    pub state: Bytes,
}

/// Shared read-only view of the live snapshot; replication drivers read it
/// when a follower has fallen behind the compaction boundary.
pub(crate) type SnapshotSlot = Arc<parking_lot::RwLock<Option<Arc<Snapshot>>>>;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Metadata {
    last_index: u64,
    last_term: u64,
    peers: Vec<PeerInfo>,
}

/// On-disk snapshot directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Opens (creating if needed) `<root>/snapshot`.
    pub async fn open(root: &Path) -> Result<Self> {
        let dir = root.join("snapshot");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Loads the snapshot with the highest `(term, index)`, if any.
    ///
    /// A metadata file without its blob (a crash between renames cannot
    /// produce this, but operators can) is skipped with a warning.
    pub async fn load_latest(&self) -> Result<Option<Snapshot>> {
        let mut pairs = self.list().await?;
        pairs.sort_unstable();
        for (term, index) in pairs.into_iter().rev() {
            let meta_path = self.meta_path(term, index);
            let blob_path = self.blob_path(term, index);
            let meta_bytes = fs::read(&meta_path).await?;
            let meta: Metadata = match serde_json::from_slice(&meta_bytes) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(path = %meta_path.display(), %err, "skipping unreadable snapshot metadata");
                    continue;
                }
            };
            let state = match fs::read(&blob_path).await {
                Ok(bytes) => Bytes::from(bytes),
                Err(err) => {
                    warn!(path = %blob_path.display(), %err, "snapshot blob missing, skipping");
                    continue;
                }
            };
            return Ok(Some(Snapshot {
                last_index: meta.last_index,
                last_term: meta.last_term,
                peers: meta.peers,
                state,
            }));
        }
        Ok(None)
    }

    /// Durably writes `snapshot` and removes any older pairs.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let blob_path = self.blob_path(snapshot.last_term, snapshot.last_index);
        let meta_path = self.meta_path(snapshot.last_term, snapshot.last_index);

        write_atomic(&blob_path, &snapshot.state).await?;
        let meta = Metadata {
            last_index: snapshot.last_index,
            last_term: snapshot.last_term,
            peers: snapshot.peers.clone(),
        };
        write_atomic(&meta_path, &serde_json::to_vec(&meta)?).await?;

        self.purge_older(snapshot.last_term, snapshot.last_index)
            .await?;
        Ok(())
    }

    async fn purge_older(&self, keep_term: u64, keep_index: u64) -> Result<()> {
        for (term, index) in self.list().await? {
            if (term, index) == (keep_term, keep_index) {
                continue;
            }
            let _ = fs::remove_file(self.meta_path(term, index)).await;
            let _ = fs::remove_file(self.blob_path(term, index)).await;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(u64, u64)>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".meta") else {
                continue;
            };
            if let Some(pair) = parse_stem(stem) {
                out.push(pair);
            }
        }
        Ok(out)
    }

    fn blob_path(&self, term: u64, index: u64) -> PathBuf {
        self.dir.join(format!("{}_{}.ss", term, index))
    }

    fn meta_path(&self, term: u64, index: u64) -> PathBuf {
        self.dir.join(format!("{}_{}.meta", term, index))
    }
}

fn parse_stem(stem: &str) -> Option<(u64, u64)> {
    let (term, index) = stem.split_once('_')?;
    Some((term.parse().ok()?, index.parse().ok()?))
}

/// Writes `contents` to a `.tmp` sibling, fsyncs, and renames into place.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}
