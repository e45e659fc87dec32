//! On-disk layout for the file backend.
//!
//! `heatmap.json` holds a compacted snapshot. Every accepted batch is first
//! appended as one JSON line to `heatmap.journal`. Compaction moves the journal
//! aside to `heatmap.journal.prev`, writes a fresh snapshot and then deletes
//! the moved journal. Each snapshot bucket remembers the last journal sequence
//! it contains, so replay never applies an entry twice.

use crate::grid::ViewportBucket;
use crate::models::{PointerCell, ScrollCell};
use crate::store::{AggregateBucket, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreData {
    pub buckets: Vec<StoredBucket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBucket {
    pub slug: String,
    pub viewport_bucket: ViewportBucket,
    #[serde(flatten)]
    pub bucket: AggregateBucket,
}

/// One batch as it is folded into a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    #[serde(default)]
    pub seq: u64,
    pub slug: String,
    pub viewport_bucket: ViewportBucket,
    pub dedup_key: String,
    /// Seen keys without this prefix are dropped before the merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prune_prefix: Option<String>,
    pub pointer: Vec<PointerCell>,
    pub scroll: Vec<ScrollCell>,
    pub at: String,
}

pub fn journal_path(data_path: &Path) -> PathBuf {
    data_path.with_extension("journal")
}

pub fn rotated_journal_path(data_path: &Path) -> PathBuf {
    data_path.with_extension("journal.prev")
}

pub async fn load_data(path: &Path) -> StoreData {
    match fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(data) => data,
            Err(err) => {
                error!("failed to parse data file: {err}");
                StoreData::default()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
        Err(err) => {
            error!("failed to read data file: {err}");
            StoreData::default()
        }
    }
}

/// Writes beside the target and renames, so readers never see a torn file.
pub async fn persist_data(path: &Path, data: &StoreData) -> Result<(), StoreError> {
    let payload = serde_json::to_vec_pretty(data)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Reads every intact line. A torn or garbled line is logged and skipped.
pub async fn read_journal(path: &Path) -> Vec<JournalEntry> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            error!("failed to read journal {}: {err}", path.display());
            return Vec::new();
        }
    };

    bytes
        .split(|byte| *byte == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .filter_map(|line| match serde_json::from_slice(line) {
            Ok(entry) => Some(entry),
            Err(err) => {
                error!("skipping unreadable journal line: {err}");
                None
            }
        })
        .collect()
}

pub async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

/// Append-only batch log. The handle is opened lazily and reopened after a
/// rotation.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: Option<fs::File>,
    next_seq: u64,
    pending: u64,
    torn: bool,
}

impl Journal {
    pub fn new(path: PathBuf, next_seq: u64) -> Self {
        Self {
            path,
            file: None,
            next_seq: next_seq.max(1),
            pending: 0,
            torn: false,
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Makes sure later appends are numbered above `seq`.
    pub fn skip_past(&mut self, seq: u64) {
        self.next_seq = self.next_seq.max(seq + 1);
    }

    /// Entries written since the last rotation.
    pub fn pending(&self) -> u64 {
        self.pending
    }

    /// Stamps `entry` with the next sequence number and appends it.
    pub async fn append(&mut self, entry: &mut JournalEntry) -> Result<(), StoreError> {
        entry.seq = self.next_seq;
        let mut line = Vec::new();
        if self.torn {
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, &*entry)?;
        line.push(b'\n');

        let file = match self.file.take() {
            Some(file) => file,
            None => {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?
            }
        };
        let file = self.file.insert(file);

        if let Err(err) = write_line(file, &line).await {
            self.file = None;
            self.torn = true;
            return Err(err.into());
        }

        self.torn = false;
        self.next_seq += 1;
        self.pending += 1;
        Ok(())
    }

    /// Moves the current journal to `to`. Returns false when there was nothing
    /// to move.
    pub async fn rotate(&mut self, to: &Path) -> Result<bool, StoreError> {
        if self.pending == 0 {
            return Ok(false);
        }
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        fs::rename(&self.path, to).await?;
        self.pending = 0;
        self.torn = false;
        Ok(true)
    }
}

async fn write_line(file: &mut fs::File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await
}
