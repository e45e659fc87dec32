//! Durable per-`(slug, viewportBucket)` accumulators.
//!
//! Every bucket sits behind its own mutex. A batch is journaled and folded
//! into its bucket inside one critical section, so totals, cells and rollups
//! never drift apart, and a batch that failed to reach the journal never
//! reaches memory either. Writers for different keys only share the journal
//! append, which is proportional to the batch. The map itself is only
//! write-locked when a new key appears.

use crate::config::{Backend, ViewerWindow};
use crate::grid::{GRID_HEIGHT, GRID_WIDTH, SCROLL_BUCKETS, ViewportBucket, cell_index};
use crate::models::{PointerCell, ScrollCell};
use crate::storage::{
    Journal, JournalEntry, StoreData, StoredBucket, journal_path, load_data, persist_data,
    read_journal, remove_if_exists, rotated_journal_path,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to encode aggregates: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write aggregates: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub slug: String,
    pub viewport: ViewportBucket,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateBucket {
    /// Batches received. One batch is one sample.
    pub samples: u64,
    pub viewers: u64,
    pub interactions: u64,
    /// Pointer grid, row-major via [`cell_index`].
    pub cells: Vec<u64>,
    pub scroll: Vec<u64>,
    pub areas: BTreeMap<String, u64>,
    pub events: BTreeMap<String, u64>,
    #[serde(default)]
    pub seen: BTreeSet<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    /// Highest journal sequence folded in.
    #[serde(default)]
    pub last_seq: u64,
}

impl Default for AggregateBucket {
    fn default() -> Self {
        Self {
            samples: 0,
            viewers: 0,
            interactions: 0,
            cells: vec![0; GRID_WIDTH * GRID_HEIGHT],
            scroll: vec![0; SCROLL_BUCKETS],
            areas: BTreeMap::new(),
            events: BTreeMap::new(),
            seen: BTreeSet::new(),
            updated_at: None,
            last_seq: 0,
        }
    }
}

/// A batch that already passed ingestion validation.
#[derive(Debug, Clone)]
pub struct Batch {
    pub slug: String,
    pub viewport: ViewportBucket,
    pub session_id: String,
    pub pointer: Vec<PointerCell>,
    pub scroll: Vec<ScrollCell>,
}

impl Batch {
    pub fn cell_count(&self) -> usize {
        self.pointer.len() + self.scroll.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub stored: bool,
    pub new_viewer: bool,
}

impl AggregateBucket {
    /// Folds one entry in. Returns whether its dedup key was a new viewer.
    pub fn apply(&mut self, entry: &JournalEntry) -> bool {
        if let Some(prefix) = &entry.prune_prefix {
            self.seen.retain(|seen| seen.starts_with(prefix.as_str()));
        }

        for cell in &entry.pointer {
            let (x, y) = (cell.x as usize, cell.y as usize);
            if x >= GRID_WIDTH || y >= GRID_HEIGHT {
                continue;
            }
            let count = u64::from(cell.count);
            let slot = &mut self.cells[cell_index(x, y)];
            *slot = slot.saturating_add(count);
            bump(&mut self.areas, &cell.area, count);
            bump(&mut self.events, cell.kind.as_str(), count);
            self.interactions = self.interactions.saturating_add(count);
        }

        for cell in &entry.scroll {
            let Some(slot) = self.scroll.get_mut(cell.bucket as usize) else {
                continue;
            };
            let count = u64::from(cell.count);
            *slot = slot.saturating_add(count);
            self.interactions = self.interactions.saturating_add(count);
        }

        self.samples = self.samples.saturating_add(1);

        let new_viewer = self.seen.insert(entry.dedup_key.clone());
        if new_viewer {
            self.viewers = self.viewers.saturating_add(1);
        }

        self.updated_at = Some(entry.at.clone());
        self.last_seq = self.last_seq.max(entry.seq);
        new_viewer
    }

    fn normalize(&mut self) {
        self.cells.resize(GRID_WIDTH * GRID_HEIGHT, 0);
        self.scroll.resize(SCROLL_BUCKETS, 0);
    }
}

fn bump(map: &mut BTreeMap<String, u64>, key: &str, count: u64) {
    match map.get_mut(key) {
        Some(total) => *total = total.saturating_add(count),
        None => {
            map.insert(key.to_string(), count);
        }
    }
}

pub struct AggregateStore {
    backend: Backend,
    window: ViewerWindow,
    buckets: RwLock<BTreeMap<BucketKey, Arc<Mutex<AggregateBucket>>>>,
    journal: Option<Mutex<Journal>>,
    compact_lock: Mutex<()>,
}

impl AggregateStore {
    pub fn new(backend: Backend, window: ViewerWindow) -> Self {
        Self::from_data(backend, window, StoreData::default())
    }

    pub fn from_data(backend: Backend, window: ViewerWindow, data: StoreData) -> Self {
        let mut buckets = BTreeMap::new();
        let mut last_seq = 0;
        for stored in data.buckets {
            let mut bucket = stored.bucket;
            bucket.normalize();
            last_seq = last_seq.max(bucket.last_seq);
            let key = BucketKey {
                slug: stored.slug,
                viewport: stored.viewport_bucket,
            };
            buckets.insert(key, Arc::new(Mutex::new(bucket)));
        }

        let journal = match &backend {
            Backend::File(path) => Some(Mutex::new(Journal::new(journal_path(path), last_seq + 1))),
            Backend::Memory => None,
        };

        Self {
            backend,
            window,
            buckets: RwLock::new(buckets),
            journal,
            compact_lock: Mutex::new(()),
        }
    }

    /// Loads the snapshot, replays any journal left behind, and folds the
    /// result into a fresh snapshot so the new journal starts empty.
    pub async fn open(backend: Backend, window: ViewerWindow) -> Result<Self, StoreError> {
        let Backend::File(path) = &backend else {
            return Ok(Self::new(backend, window));
        };
        let path = path.clone();

        let data = load_data(&path).await;
        let mut entries = read_journal(&rotated_journal_path(&path)).await;
        entries.extend(read_journal(&journal_path(&path)).await);

        let store = Self::from_data(backend, window, data);
        let replayed = store.replay(entries).await;
        if replayed > 0 {
            info!("replayed {replayed} journaled heatmap batches");
            persist_data(&path, &store.export().await).await?;
        }
        remove_if_exists(&rotated_journal_path(&path)).await?;
        remove_if_exists(&journal_path(&path)).await?;
        Ok(store)
    }

    async fn replay(&self, entries: Vec<JournalEntry>) -> usize {
        let mut replayed = 0;
        let mut last_seq = 0;
        for entry in entries {
            last_seq = last_seq.max(entry.seq);
            let key = BucketKey {
                slug: entry.slug.clone(),
                viewport: entry.viewport_bucket,
            };
            let handle = self.entry(key).await;
            let mut bucket = handle.lock().await;
            if entry.seq > bucket.last_seq {
                bucket.apply(&entry);
                replayed += 1;
            }
        }

        if let Some(journal) = &self.journal {
            journal.lock().await.skip_past(last_seq);
        }
        replayed
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub async fn record(&self, batch: &Batch, viewer_id: &str) -> Result<RecordOutcome, StoreError> {
        self.record_at(batch, viewer_id, Utc::now()).await
    }

    pub async fn record_at(
        &self,
        batch: &Batch,
        viewer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, StoreError> {
        let (dedup_key, prune_prefix) = match self.window {
            ViewerWindow::Forever => (viewer_id.to_string(), None),
            ViewerWindow::Day => {
                let prefix = format!("{}:", now.date_naive());
                (format!("{prefix}{viewer_id}"), Some(prefix))
            }
            ViewerWindow::Session => (format!("{viewer_id}:{}", batch.session_id), None),
        };
        let mut entry = JournalEntry {
            seq: 0,
            slug: batch.slug.clone(),
            viewport_bucket: batch.viewport,
            dedup_key,
            prune_prefix,
            pointer: batch.pointer.clone(),
            scroll: batch.scroll.clone(),
            at: now.to_rfc3339(),
        };

        let handle = self
            .entry(BucketKey {
                slug: batch.slug.clone(),
                viewport: batch.viewport,
            })
            .await;
        let mut bucket = handle.lock().await;

        let stored = match &self.journal {
            Some(journal) => {
                journal
                    .lock()
                    .await
                    .append(&mut entry)
                    .await
                    .inspect_err(|err| error!("failed to journal heatmap batch: {err}"))?;
                true
            }
            None => false,
        };

        let new_viewer = bucket.apply(&entry);
        Ok(RecordOutcome { stored, new_viewer })
    }

    async fn entry(&self, key: BucketKey) -> Arc<Mutex<AggregateBucket>> {
        if let Some(existing) = self.buckets.read().await.get(&key) {
            return Arc::clone(existing);
        }
        let mut buckets = self.buckets.write().await;
        Arc::clone(buckets.entry(key).or_default())
    }

    /// Buckets for one slug, ordered by viewport bucket. Buckets whose first
    /// write failed stay empty and are left out.
    pub async fn slug_buckets(
        &self,
        slug: &str,
        filter: Option<ViewportBucket>,
    ) -> Vec<(ViewportBucket, AggregateBucket)> {
        let handles: Vec<_> = self
            .buckets
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.slug == slug)
            .filter(|(key, _)| filter.is_none_or(|wanted| key.viewport == wanted))
            .map(|(key, bucket)| (key.viewport, Arc::clone(bucket)))
            .collect();

        let mut out = Vec::with_capacity(handles.len());
        for (viewport, bucket) in handles {
            let bucket = bucket.lock().await.clone();
            if bucket.samples > 0 {
                out.push((viewport, bucket));
            }
        }
        out
    }

    pub async fn slugs(&self) -> Vec<String> {
        let data = self.export().await;
        let slugs: BTreeSet<String> = data.buckets.into_iter().map(|stored| stored.slug).collect();
        slugs.into_iter().collect()
    }

    pub async fn export(&self) -> StoreData {
        let handles: Vec<_> = self
            .buckets
            .read()
            .await
            .iter()
            .map(|(key, bucket)| (key.clone(), Arc::clone(bucket)))
            .collect();

        let mut data = StoreData::default();
        for (key, bucket) in handles {
            let bucket = bucket.lock().await.clone();
            if bucket.samples == 0 {
                continue;
            }
            data.buckets.push(StoredBucket {
                slug: key.slug,
                viewport_bucket: key.viewport,
                bucket,
            });
        }
        data
    }

    /// Folds the journal into a new snapshot. Returns whether anything was
    /// compacted.
    pub async fn compact(&self) -> Result<bool, StoreError> {
        let (Backend::File(path), Some(journal)) = (&self.backend, &self.journal) else {
            return Ok(false);
        };
        let _guard = self.compact_lock.lock().await;
        let rotated = rotated_journal_path(path);

        // A previous compaction moved the journal but never got to snapshot it.
        if tokio::fs::try_exists(&rotated).await? {
            persist_data(path, &self.export().await).await?;
            remove_if_exists(&rotated).await?;
        }

        if !journal.lock().await.rotate(&rotated).await? {
            return Ok(false);
        }
        // Every rotated entry was applied before its bucket lock was released,
        // and export takes each bucket lock, so the snapshot covers them all.
        persist_data(path, &self.export().await).await?;
        remove_if_exists(&rotated).await?;
        Ok(true)
    }
}

/// Compacts on a fixed cadence until the task is aborted.
pub async fn run_compaction(store: Arc<AggregateStore>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match store.compact().await {
            Ok(true) => info!("compacted heatmap journal"),
            Ok(false) => {}
            Err(err) => error!("heatmap compaction failed: {err}"),
        }
    }
}
