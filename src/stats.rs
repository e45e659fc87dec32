use crate::grid::{GRID_HEIGHT, GRID_WIDTH, SCROLL_BUCKETS, ViewportBucket, cell_index};
use crate::models::{
    BucketBreakdown, BucketGrid, CellShare, ScrollShare, ShareEntry, SlugSummary,
};
use crate::store::AggregateBucket;
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_LIMIT: usize = 5;
pub const MAX_LIMIT: usize = 50;

pub fn parse_limit(raw: Option<&str>) -> usize {
    raw.and_then(|value| value.trim().parse::<usize>().ok())
        .map(|limit| limit.clamp(1, MAX_LIMIT))
        .unwrap_or(DEFAULT_LIMIT)
}

/// `count / total`, or 0 when nothing was recorded.
pub fn share(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

pub fn bucket_grid(viewport: ViewportBucket, bucket: &AggregateBucket) -> BucketGrid {
    let cells = (0..GRID_HEIGHT)
        .map(|y| {
            (0..GRID_WIDTH)
                .map(|x| bucket.cells.get(cell_index(x, y)).copied().unwrap_or(0))
                .collect()
        })
        .collect();

    BucketGrid {
        viewport_bucket: viewport.as_str().to_string(),
        samples: bucket.samples,
        viewers: bucket.viewers,
        interactions: bucket.interactions,
        width: GRID_WIDTH,
        height: GRID_HEIGHT,
        cells,
        scroll: bucket.scroll.clone(),
        areas: bucket.areas.clone(),
        events: bucket.events.clone(),
        updated_at: bucket.updated_at.clone(),
    }
}

pub fn build_summary(
    slug: &str,
    buckets: &[(ViewportBucket, AggregateBucket)],
    limit: usize,
) -> SlugSummary {
    let mut samples = 0u64;
    let mut viewers = 0u64;
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut interactions = 0u64;
    let mut areas: BTreeMap<String, u64> = BTreeMap::new();
    let mut events: BTreeMap<String, u64> = BTreeMap::new();
    let mut cells = vec![0u64; GRID_WIDTH * GRID_HEIGHT];
    let mut scroll = vec![0u64; SCROLL_BUCKETS];

    for (_, bucket) in buckets {
        samples = samples.saturating_add(bucket.samples);
        // Keys still in `seen` are deduped across buckets below. Viewers whose
        // keys were pruned by the day window can only be summed.
        let pruned = bucket.viewers.saturating_sub(bucket.seen.len() as u64);
        viewers = viewers.saturating_add(pruned);
        seen.extend(bucket.seen.iter().map(String::as_str));
        interactions = interactions.saturating_add(bucket.interactions);
        for (area, count) in &bucket.areas {
            let total = areas.entry(area.clone()).or_default();
            *total = total.saturating_add(*count);
        }
        for (event, count) in &bucket.events {
            let total = events.entry(event.clone()).or_default();
            *total = total.saturating_add(*count);
        }
        for (slot, count) in cells.iter_mut().zip(&bucket.cells) {
            *slot = slot.saturating_add(*count);
        }
        for (slot, count) in scroll.iter_mut().zip(&bucket.scroll) {
            *slot = slot.saturating_add(*count);
        }
    }

    let viewers = viewers.saturating_add(seen.len() as u64);

    let mut top_cells: Vec<CellShare> = cells
        .iter()
        .enumerate()
        .filter(|(_, count)| **count > 0)
        .map(|(index, count)| CellShare {
            x: index % GRID_WIDTH,
            y: index / GRID_WIDTH,
            count: *count,
            share: share(*count, interactions),
        })
        .collect();
    // Stable sort keeps row-major order among equal counts.
    top_cells.sort_by(|a, b| b.count.cmp(&a.count));
    top_cells.truncate(limit);

    let scroll_total: u64 = scroll.iter().sum();
    let scroll = scroll
        .iter()
        .enumerate()
        .map(|(bucket, count)| ScrollShare {
            bucket,
            count: *count,
            share: share(*count, scroll_total),
        })
        .collect();

    let buckets = buckets
        .iter()
        .map(|(viewport, bucket)| BucketBreakdown {
            viewport_bucket: viewport.as_str().to_string(),
            samples: bucket.samples,
            viewers: bucket.viewers,
            interactions: bucket.interactions,
            share: share(bucket.interactions, interactions),
        })
        .collect();

    SlugSummary {
        slug: slug.to_string(),
        samples,
        viewers,
        interactions,
        top_zones: top_entries(&areas, interactions, limit),
        top_events: top_entries(&events, interactions, limit),
        top_cells,
        scroll,
        buckets,
    }
}

/// Count descending; the map's lexical order breaks ties.
fn top_entries(map: &BTreeMap<String, u64>, total: u64, limit: usize) -> Vec<ShareEntry> {
    let mut entries: Vec<ShareEntry> = map
        .iter()
        .map(|(key, count)| ShareEntry {
            key: key.clone(),
            count: *count,
            share: share(*count, total),
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count));
    entries.truncate(limit);
    entries
}
