//! Durable, append-only entry log.
//!
//! On disk the log is a single file of `varint(len) ‖ LogEntry` frames.
//! Opening reads the longest prefix that decodes cleanly and truncates the
//! rest (a crash mid-append leaves a torn tail, never a corrupt log).
//! Appends are fsynced before they return.
//!
//! The handle is cheap to clone. The server's event loop is the only
//! writer; replication drivers read entry batches concurrently through the
//! in-memory cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::proto::{self, LogEntry};

/// Result of a tail read for replication.
#[derive(Debug)]
pub enum Tail {
    /// The contiguous entries after the requested index, and the term of
    /// the entry at it (the compaction boundary's term when the index is
    /// the boundary).
    Entries {
        entries: Vec<LogEntry>,
        prev_term: u64,
    },
    /// The requested index has been compacted away; the caller needs the
    /// snapshot instead.
    Compacted,
}

struct Cache {
    /// Index/term of the last compacted entry; the log starts at
    /// `base_index + 1`.
    base_index: u64,
    base_term: u64,
    /// Contiguous entries; `entries[i].index == base_index + 1 + i`.
    entries: Vec<LogEntry>,
    /// File offset of each entry's frame.
    positions: Vec<u64>,
    /// Next append offset (current file length).
    end_pos: u64,
    commit_index: u64,
}

impl Cache {
    fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(self.base_index)
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(self.base_term)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.base_index {
            return Some(self.base_term);
        }
        self.entry_at(index).map(|e| e.term)
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.base_index || index > self.last_index() {
            return None;
        }
        self.entries.get((index - self.base_index - 1) as usize)
    }
}

struct Writer {
    file: File,
}

/// The replicated log.
#[derive(Clone)]
pub struct Log {
    cache: Arc<RwLock<Cache>>,
    writer: Arc<tokio::sync::Mutex<Writer>>,
    path: PathBuf,
}

impl Log {
    /// Opens (creating if needed) the log file at `path`.
    ///
    /// Rebuilds the in-memory entry cache and offset map, keeping the
    /// longest cleanly decodable prefix; trailing bytes that do not decode
    /// are discarded from the file.
    pub async fn open(path: &Path) -> Result<Log> {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let mut entries: Vec<LogEntry> = Vec::new();
        let mut positions = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() {
            match proto::try_decode_frame::<LogEntry>(&data[pos..]) {
                Ok(Some((entry, consumed))) => {
                    if let Some(last) = entries.last() {
                        if entry.index != last.index + 1 || entry.term < last.term {
                            warn!(
                                index = entry.index,
                                after = last.index,
                                "log entry out of sequence, discarding from here"
                            );
                            break;
                        }
                    }
                    positions.push(pos as u64);
                    entries.push(entry);
                    pos += consumed;
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        if pos < data.len() {
            warn!(
                dropped = data.len() - pos,
                kept = pos,
                path = %path.display(),
                "discarding undecodable log tail"
            );
            let file = OpenOptions::new().write(true).open(path).await?;
            file.set_len(pos as u64).await?;
            file.sync_all().await?;
        }

        let base_index = entries.first().map(|e| e.index - 1).unwrap_or(0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        debug!(
            entries = entries.len(),
            start_index = base_index + 1,
            "log opened"
        );

        Ok(Log {
            cache: Arc::new(RwLock::new(Cache {
                base_index,
                base_term: 0,
                entries,
                positions,
                end_pos: pos as u64,
                commit_index: base_index,
            })),
            writer: Arc::new(tokio::sync::Mutex::new(Writer { file })),
            path: path.to_path_buf(),
        })
    }

    /// Anchors the log to a snapshot boundary.
    ///
    /// Entries at or below the boundary are dropped from the cache (their
    /// file bytes linger until the next compaction). If the snapshot covers
    /// the whole log, the file is cleared.
    pub async fn anchor(&self, index: u64, term: u64) -> Result<()> {
        let covers_all = {
            let cache = self.cache.read();
            index >= cache.last_index()
        };
        if covers_all {
            let mut writer = self.writer.lock().await;
            writer.file.set_len(0).await?;
            writer.file.sync_all().await?;
            let mut cache = self.cache.write();
            cache.base_index = index;
            cache.base_term = term;
            cache.entries.clear();
            cache.positions.clear();
            cache.end_pos = 0;
            cache.commit_index = index;
        } else {
            let mut cache = self.cache.write();
            if index > cache.base_index {
                let drop = (index - cache.base_index) as usize;
                cache.entries.drain(..drop);
                cache.positions.drain(..drop);
                cache.base_index = index;
            }
            cache.base_term = term;
            cache.commit_index = cache.commit_index.max(index);
        }
        Ok(())
    }

    /// Appends one entry; fsyncs before returning.
    pub async fn append(&self, entry: LogEntry) -> Result<()> {
        self.append_entries(vec![entry]).await
    }

    /// Appends a batch with a single fsync.
    ///
    /// Entries must continue the log: dense indices, non-decreasing terms.
    /// On a write failure the partial write is truncated away before the
    /// error surfaces.
    pub async fn append_entries(&self, entries: Vec<LogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let (mut next_index, mut last_term, start_pos) = {
            let cache = self.cache.read();
            (cache.last_index() + 1, cache.last_term(), cache.end_pos)
        };

        let mut buf = BytesMut::new();
        let mut positions = Vec::with_capacity(entries.len());
        for entry in &entries {
            if entry.index != next_index || entry.term < last_term {
                return Err(Error::LogMismatch {
                    expected_term: last_term,
                    at_index: entry.index,
                });
            }
            positions.push(start_pos + buf.len() as u64);
            proto::encode_frame(entry, &mut buf)?;
            next_index += 1;
            last_term = entry.term;
        }

        let mut writer = self.writer.lock().await;
        let write = async {
            writer.file.write_all(&buf).await?;
            writer.file.sync_all().await?;
            Ok::<_, std::io::Error>(())
        };
        if let Err(err) = write.await {
            let _ = writer.file.set_len(start_pos).await;
            let _ = writer.file.sync_all().await;
            return Err(err.into());
        }
        drop(writer);

        let mut cache = self.cache.write();
        cache.end_pos = start_pos + buf.len() as u64;
        cache.entries.extend(entries);
        cache.positions.extend(positions);
        Ok(())
    }

    /// Removes all entries with index greater than `after_index`.
    ///
    /// Refuses to remove committed entries, and refuses when the entry at
    /// the boundary does not carry `expected_term`.
    pub async fn truncate(&self, after_index: u64, expected_term: u64) -> Result<()> {
        let (offset, keep) = {
            let cache = self.cache.read();
            if after_index < cache.commit_index {
                return Err(Error::LogMismatch {
                    expected_term,
                    at_index: after_index,
                });
            }
            if let Some(term) = cache.term_at(after_index) {
                if term != expected_term {
                    return Err(Error::LogMismatch {
                        expected_term,
                        at_index: after_index,
                    });
                }
            }
            if after_index >= cache.last_index() {
                return Ok(());
            }
            let keep = (after_index - cache.base_index) as usize;
            (cache.positions[keep], keep)
        };

        let mut writer = self.writer.lock().await;
        writer.file.set_len(offset).await?;
        writer.file.sync_all().await?;
        drop(writer);

        let mut cache = self.cache.write();
        cache.entries.truncate(keep);
        cache.positions.truncate(keep);
        cache.end_pos = offset;
        debug!(after_index, "log truncated");
        Ok(())
    }

    /// Drops the prefix up to and including `up_to_index`, rewriting the
    /// file atomically (write to `log.tmp`, fsync, rename).
    ///
    /// An `up_to_index` past the last entry resets the log to an empty tail
    /// anchored at `(up_to_index, up_to_term)`; snapshot installation uses
    /// this.
    pub async fn compact(&self, up_to_index: u64, up_to_term: u64) -> Result<()> {
        let tail: Vec<LogEntry> = {
            let cache = self.cache.read();
            if up_to_index <= cache.base_index {
                return Ok(());
            }
            cache
                .entries
                .iter()
                .filter(|e| e.index > up_to_index)
                .cloned()
                .collect()
        };

        let mut buf = BytesMut::new();
        let mut positions = Vec::with_capacity(tail.len());
        for entry in &tail {
            positions.push(buf.len() as u64);
            proto::encode_frame(entry, &mut buf)?;
        }

        let tmp = self.path.with_extension("tmp");
        let mut writer = self.writer.lock().await;
        let mut file = File::create(&tmp).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;
        writer.file = OpenOptions::new().append(true).open(&self.path).await?;
        drop(writer);

        let mut cache = self.cache.write();
        cache.base_index = up_to_index;
        cache.base_term = up_to_term;
        cache.entries = tail;
        cache.positions = positions;
        cache.end_pos = buf.len() as u64;
        cache.commit_index = cache.commit_index.max(up_to_index);
        debug!(start_index = up_to_index + 1, "log compacted");
        Ok(())
    }

    /// Monotonically advances the commit index, never past the last entry.
    /// Returns the resulting commit index.
    pub fn commit(&self, index: u64) -> u64 {
        let mut cache = self.cache.write();
        let clamped = index.min(cache.last_index());
        if clamped > cache.commit_index {
            cache.commit_index = clamped;
        }
        cache.commit_index
    }

    /// The contiguous tail after `index`, bounded by `max_entries` and a
    /// soft byte cap (at least one entry is always included).
    pub fn entries_after(&self, index: u64, max_entries: usize, max_bytes: usize) -> Tail {
        let cache = self.cache.read();
        if index < cache.base_index {
            return Tail::Compacted;
        }
        let prev_term = match cache.term_at(index) {
            Some(term) => term,
            None => return Tail::Compacted,
        };
        let mut entries = Vec::new();
        let mut bytes = 0usize;
        let mut next = index + 1;
        while next <= cache.last_index() && entries.len() < max_entries {
            let entry = cache.entry_at(next).expect("contiguous range");
            bytes += proto::frame_len(entry);
            if !entries.is_empty() && bytes > max_bytes {
                break;
            }
            entries.push(entry.clone());
            next += 1;
        }
        Tail::Entries { entries, prev_term }
    }

    /// Entries in `[from, to]`, clamped to what the log holds.
    pub fn range(&self, from: u64, to: u64) -> Vec<LogEntry> {
        let cache = self.cache.read();
        let from = from.max(cache.base_index + 1);
        let to = to.min(cache.last_index());
        if from > to {
            return Vec::new();
        }
        let start = (from - cache.base_index - 1) as usize;
        let end = (to - cache.base_index) as usize;
        cache.entries[start..end].to_vec()
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.cache.read().term_at(index)
    }

    pub fn last_index(&self) -> u64 {
        self.cache.read().last_index()
    }

    pub fn last_term(&self) -> u64 {
        self.cache.read().last_term()
    }

    /// `(last_index, last_term)` in one read.
    pub fn last_info(&self) -> (u64, u64) {
        let cache = self.cache.read();
        (cache.last_index(), cache.last_term())
    }

    pub fn commit_index(&self) -> u64 {
        self.cache.read().commit_index
    }

    /// First index present (after the compaction boundary).
    pub fn start_index(&self) -> u64 {
        self.cache.read().base_index + 1
    }

    pub fn base_index(&self) -> u64 {
        self.cache.read().base_index
    }

    /// True when no entry was ever appended or compacted into this log.
    pub fn is_empty(&self) -> bool {
        let cache = self.cache.read();
        cache.base_index == 0 && cache.entries.is_empty()
    }

    /// Entries applied beyond the compaction boundary.
    pub fn entries_since_base(&self) -> u64 {
        let cache = self.cache.read();
        cache.last_index() - cache.base_index
    }
}
