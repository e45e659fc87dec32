//! Pointer and scroll sampling for one tracked root.
//!
//! The engine is driven from the outside: the host forwards pointer and scroll
//! events with their timestamps and calls [`HeatmapTracker::poll`] from its
//! timer. At most one flush deadline exists per root, and it is cleared before
//! any flush runs.

use super::delivery::{Delivery, deliver};
use super::session::{SessionStorage, resolve_session_id};
use crate::grid::{
    DEFAULT_AREA, GRID_HEIGHT, GRID_WIDTH, ViewportBucket, normalize_area, quantize, scroll_bucket,
};
use crate::models::{BatchPayload, PointerCell, PointerKind, ScrollCell};
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::debug;

pub const MOVE_DEBOUNCE_MS: u64 = 120;
pub const SCROLL_DEBOUNCE_MS: u64 = 400;
pub const FLUSH_THRESHOLD: usize = 10;
pub const FLUSH_DELAY_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScrollMetrics {
    pub scroll_y: f64,
    pub document_height: f64,
    pub viewport_height: f64,
}

/// The element the tracker is attached to, plus the page geometry around it.
pub trait TrackedRoot {
    fn bounding_rect(&self) -> Rect;
    fn scroll_metrics(&self) -> ScrollMetrics;
    fn viewport_width(&self) -> f64;
}

#[derive(Debug, Clone, Copy)]
pub struct PointerEvent<'a> {
    pub client_x: f64,
    pub client_y: f64,
    pub timestamp_ms: u64,
    /// Zone tags from the event target up to the root, nearest first.
    pub zone_path: &'a [Option<&'a str>],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerOptions {
    pub slug: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CellKey {
    area: String,
    kind: PointerKind,
    x: u8,
    y: u8,
}

struct ActiveSession {
    slug: String,
    session_id: Option<String>,
    viewport: ViewportBucket,
    last_move: Option<(CellKey, u64)>,
    last_scroll_ms: Option<u64>,
    pointer: BTreeMap<CellKey, u32>,
    scroll: BTreeMap<u8, u32>,
    flush_at: Option<u64>,
}

impl ActiveSession {
    fn new(slug: String, viewport: ViewportBucket) -> Self {
        Self {
            slug,
            session_id: None,
            viewport,
            last_move: None,
            last_scroll_ms: None,
            pointer: BTreeMap::new(),
            scroll: BTreeMap::new(),
            flush_at: None,
        }
    }

    fn buffered(&self) -> usize {
        self.pointer.len() + self.scroll.len()
    }
}

pub struct HeatmapTracker<R: TrackedRoot, S: SessionStorage, D: Delivery> {
    root: R,
    storage: S,
    delivery: D,
    active: Option<ActiveSession>,
}

impl<R: TrackedRoot, S: SessionStorage, D: Delivery> HeatmapTracker<R, S, D> {
    /// Binds to `root`. A disabled tracker or an empty slug stays inert.
    pub fn attach(root: R, storage: S, delivery: D, options: TrackerOptions) -> Self {
        let mut tracker = Self {
            root,
            storage,
            delivery,
            active: None,
        };
        tracker.activate(options);
        tracker
    }

    /// Flushes whatever the current slug buffered, then starts over with a
    /// fresh session token and viewport bucket.
    pub fn reattach(&mut self, options: TrackerOptions) {
        self.detach();
        self.activate(options);
    }

    fn activate(&mut self, options: TrackerOptions) {
        let slug = options.slug.trim();
        if !options.enabled || slug.is_empty() {
            return;
        }
        let viewport = ViewportBucket::from_width(self.root.viewport_width());
        self.active = Some(ActiveSession::new(slug.to_string(), viewport));
    }

    pub fn is_attached(&self) -> bool {
        self.active.is_some()
    }

    pub fn buffered_cells(&self) -> usize {
        self.active.as_ref().map_or(0, ActiveSession::buffered)
    }

    pub fn pending_flush_at(&self) -> Option<u64> {
        self.active.as_ref().and_then(|session| session.flush_at)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.active.as_ref()?.session_id.as_deref()
    }

    pub fn viewport_bucket(&self) -> Option<ViewportBucket> {
        self.active.as_ref().map(|session| session.viewport)
    }

    /// Returns whether the event produced an increment.
    pub fn on_pointer(&mut self, event: &PointerEvent<'_>, kind: PointerKind) -> bool {
        if self.active.is_none() {
            return false;
        }

        let rect = self.root.bounding_rect();
        if !(rect.width > 0.0 && rect.height > 0.0) {
            return false;
        }
        let x = quantize((event.client_x - rect.left) / rect.width, GRID_WIDTH);
        let y = quantize((event.client_y - rect.top) / rect.height, GRID_HEIGHT);
        let key = CellKey {
            area: resolve_zone(event.zone_path),
            kind,
            x: x as u8,
            y: y as u8,
        };

        let Some(session) = self.active.as_mut() else {
            return false;
        };
        if kind == PointerKind::Move {
            if let Some((last, at)) = &session.last_move {
                if *last == key && event.timestamp_ms.saturating_sub(*at) < MOVE_DEBOUNCE_MS {
                    return false;
                }
            }
            session.last_move = Some((key.clone(), event.timestamp_ms));
        }

        let count = session.pointer.entry(key).or_default();
        *count = count.saturating_add(1);
        self.after_increment(event.timestamp_ms);
        true
    }

    pub fn on_scroll(&mut self, now_ms: u64) -> bool {
        let Some(session) = self.active.as_ref() else {
            return false;
        };
        if let Some(last) = session.last_scroll_ms {
            if now_ms.saturating_sub(last) < SCROLL_DEBOUNCE_MS {
                return false;
            }
        }

        let metrics = self.root.scroll_metrics();
        let bucket = scroll_bucket(
            metrics.scroll_y,
            metrics.document_height,
            metrics.viewport_height,
        ) as u8;

        let Some(session) = self.active.as_mut() else {
            return false;
        };
        session.last_scroll_ms = Some(now_ms);
        let count = session.scroll.entry(bucket).or_default();
        *count = count.saturating_add(1);
        self.after_increment(now_ms);
        true
    }

    fn after_increment(&mut self, now_ms: u64) {
        let Some(session) = self.active.as_mut() else {
            return;
        };
        if session.session_id.is_none() {
            session.session_id = Some(resolve_session_id(&self.storage, &session.slug));
        }

        if session.buffered() >= FLUSH_THRESHOLD {
            self.flush(true);
        } else if session.flush_at.is_none() {
            session.flush_at = Some(now_ms.saturating_add(FLUSH_DELAY_MS));
        }
    }

    /// Timer hook: flushes once the pending deadline has passed.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        let Some(session) = self.active.as_mut() else {
            return false;
        };
        match session.flush_at {
            Some(deadline) if now_ms >= deadline => {
                session.flush_at = None;
                self.flush(false)
            }
            _ => false,
        }
    }

    /// Sends everything buffered and empties both maps. `immediate` also
    /// cancels the pending timer. Returns whether a batch went out.
    pub fn flush(&mut self, immediate: bool) -> bool {
        let Some(session) = self.active.as_mut() else {
            return false;
        };
        if immediate {
            session.flush_at = None;
        }
        if session.buffered() == 0 {
            return false;
        }

        let pointer = std::mem::take(&mut session.pointer)
            .into_iter()
            .map(|(key, count)| PointerCell {
                area: key.area,
                kind: key.kind,
                x: key.x,
                y: key.y,
                count,
            })
            .collect();
        let scroll = std::mem::take(&mut session.scroll)
            .into_iter()
            .map(|(bucket, count)| ScrollCell { bucket, count })
            .collect();

        let payload = BatchPayload {
            slug: session.slug.clone(),
            viewport_bucket: session.viewport.as_str().to_string(),
            session_id: session.session_id.clone().unwrap_or_default(),
            pointer,
            scroll,
            sent_at: Utc::now().to_rfc3339(),
        };

        match serde_json::to_string(&payload) {
            Ok(body) => deliver(&self.delivery, body),
            Err(err) => {
                debug!("failed to encode heatmap batch: {err}");
                false
            }
        }
    }

    pub fn on_visibility_change(&mut self, hidden: bool) {
        if hidden {
            self.detach();
        }
    }

    pub fn on_page_hide(&mut self) {
        self.detach();
    }

    /// Final flush, then drops all per-root state including the timer.
    pub fn detach(&mut self) {
        if self.active.is_some() {
            self.flush(true);
            self.active = None;
        }
    }
}

impl<R: TrackedRoot, S: SessionStorage, D: Delivery> Drop for HeatmapTracker<R, S, D> {
    fn drop(&mut self) {
        self.detach();
    }
}

fn resolve_zone(path: &[Option<&str>]) -> String {
    path.iter()
        .flatten()
        .find_map(|tag| normalize_area(tag))
        .unwrap_or_else(|| DEFAULT_AREA.to_string())
}
