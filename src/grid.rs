//! Spatial quantization shared by the tracker and the aggregate store.

use serde::{Deserialize, Serialize};

pub const GRID_WIDTH: usize = 12;
pub const GRID_HEIGHT: usize = 8;
pub const SCROLL_BUCKETS: usize = 8;

pub const DEFAULT_AREA: &str = "generic";
pub const MAX_AREA_LEN: usize = 64;

/// Coarse device-width class used to segment aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewportBucket {
    Xs,
    Sm,
    Md,
    Lg,
    Xl,
    Unknown,
}

impl ViewportBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            ViewportBucket::Xs => "xs",
            ViewportBucket::Sm => "sm",
            ViewportBucket::Md => "md",
            ViewportBucket::Lg => "lg",
            ViewportBucket::Xl => "xl",
            ViewportBucket::Unknown => "unknown",
        }
    }

    /// Exact label match, `unknown` included.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "xs" => Some(ViewportBucket::Xs),
            "sm" => Some(ViewportBucket::Sm),
            "md" => Some(ViewportBucket::Md),
            "lg" => Some(ViewportBucket::Lg),
            "xl" => Some(ViewportBucket::Xl),
            "unknown" => Some(ViewportBucket::Unknown),
            _ => None,
        }
    }

    /// Unrecognised labels collapse to `Unknown`.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "xs" => ViewportBucket::Xs,
            "sm" => ViewportBucket::Sm,
            "md" => ViewportBucket::Md,
            "lg" => ViewportBucket::Lg,
            "xl" => ViewportBucket::Xl,
            _ => ViewportBucket::Unknown,
        }
    }

    pub fn from_width(width: f64) -> Self {
        if !width.is_finite() || width <= 0.0 {
            return ViewportBucket::Unknown;
        }
        if width < 640.0 {
            ViewportBucket::Xs
        } else if width < 768.0 {
            ViewportBucket::Sm
        } else if width < 1024.0 {
            ViewportBucket::Md
        } else if width < 1280.0 {
            ViewportBucket::Lg
        } else {
            ViewportBucket::Xl
        }
    }
}

pub fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Maps a normalized position onto `[0, buckets)`.
pub fn quantize(value: f64, buckets: usize) -> usize {
    if buckets == 0 {
        return 0;
    }
    let index = (clamp01(value) * buckets as f64).floor() as usize;
    index.min(buckets - 1)
}

/// Scroll depth ratio; a page with no scroll room reports 0.
pub fn scroll_ratio(scroll_y: f64, document_height: f64, viewport_height: f64) -> f64 {
    let max_scroll = (document_height - viewport_height).max(0.0);
    if max_scroll <= 0.0 || !max_scroll.is_finite() {
        return 0.0;
    }
    clamp01(scroll_y / max_scroll)
}

pub fn scroll_bucket(scroll_y: f64, document_height: f64, viewport_height: f64) -> usize {
    quantize(
        scroll_ratio(scroll_y, document_height, viewport_height),
        SCROLL_BUCKETS,
    )
}

/// Trims a zone tag and caps its length; blank tags count as untagged.
pub fn normalize_area(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_AREA_LEN).collect())
}

pub fn cell_index(x: usize, y: usize) -> usize {
    y * GRID_WIDTH + x
}
