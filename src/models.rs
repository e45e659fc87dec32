use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerKind {
    Move,
    Down,
}

impl PointerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PointerKind::Move => "move",
            PointerKind::Down => "down",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "move" => Some(PointerKind::Move),
            "down" => Some(PointerKind::Down),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerCell {
    pub area: String,
    #[serde(rename = "type")]
    pub kind: PointerKind,
    pub x: u8,
    pub y: u8,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollCell {
    pub bucket: u8,
    pub count: u32,
}

/// One client-to-server transmission of counts accumulated since the last flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub slug: String,
    pub viewport_bucket: String,
    pub session_id: String,
    pub pointer: Vec<PointerCell>,
    pub scroll: Vec<ScrollCell>,
    pub sent_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub ok: bool,
    pub slug: String,
    pub stored: bool,
    pub backend: Option<String>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketGrid {
    pub viewport_bucket: String,
    pub samples: u64,
    pub viewers: u64,
    pub interactions: u64,
    pub width: usize,
    pub height: usize,
    /// Row-major, `cells[y][x]`.
    pub cells: Vec<Vec<u64>>,
    pub scroll: Vec<u64>,
    pub areas: BTreeMap<String, u64>,
    pub events: BTreeMap<String, u64>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub slug: String,
    pub buckets: Vec<BucketGrid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareEntry {
    pub key: String,
    pub count: u64,
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellShare {
    pub x: usize,
    pub y: usize,
    pub count: u64,
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrollShare {
    pub bucket: usize,
    pub count: u64,
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketBreakdown {
    pub viewport_bucket: String,
    pub samples: u64,
    pub viewers: u64,
    pub interactions: u64,
    pub share: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlugSummary {
    pub slug: String,
    pub samples: u64,
    pub viewers: u64,
    pub interactions: u64,
    pub top_zones: Vec<ShareEntry>,
    pub top_events: Vec<ShareEntry>,
    pub top_cells: Vec<CellShare>,
    pub scroll: Vec<ScrollShare>,
    pub buckets: Vec<BucketBreakdown>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResponse {
    pub slugs: Vec<SlugSummary>,
    pub generated_at: String,
    pub available_slugs: Vec<String>,
}
