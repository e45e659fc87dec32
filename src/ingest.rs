//! Lenient decoding of ingestion bodies.
//!
//! Only a missing slug or an unreadable body rejects the request. Everything
//! else degrades per field: unknown viewport labels become `unknown`, and
//! malformed cells are dropped one by one.

use crate::errors::AppError;
use crate::grid::{DEFAULT_AREA, GRID_HEIGHT, GRID_WIDTH, SCROLL_BUCKETS, ViewportBucket, normalize_area};
use crate::models::{PointerCell, PointerKind, ScrollCell};
use crate::store::Batch;
use serde_json::Value;

pub const MAX_SLUG_LEN: usize = 200;
pub const MAX_SESSION_LEN: usize = 64;
pub const MAX_CELL_COUNT: u32 = 10_000;

pub fn parse_batch(body: &[u8]) -> Result<Batch, AppError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| AppError::bad_request("body must be valid JSON"))?;
    let Some(object) = value.as_object() else {
        return Err(AppError::bad_request("body must be a JSON object"));
    };

    let slug = object
        .get("slug")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if slug.is_empty() {
        return Err(AppError::bad_request("slug is required"));
    }

    let viewport = object
        .get("viewportBucket")
        .and_then(Value::as_str)
        .map(ViewportBucket::parse)
        .unwrap_or(ViewportBucket::Unknown);

    let session_id = object
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .chars()
        .take(MAX_SESSION_LEN)
        .collect();

    let pointer_value = object
        .get("pointer")
        .filter(|value| value.is_array())
        .or_else(|| object.get("cells"));

    Ok(Batch {
        slug: slug.chars().take(MAX_SLUG_LEN).collect(),
        viewport,
        session_id,
        pointer: entries(pointer_value).filter_map(pointer_cell).collect(),
        scroll: entries(object.get("scroll")).filter_map(scroll_cell).collect(),
    })
}

fn entries(value: Option<&Value>) -> impl Iterator<Item = &Value> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter())
        .into_iter()
        .flatten()
}

fn pointer_cell(value: &Value) -> Option<PointerCell> {
    let kind = value.get("type").and_then(Value::as_str).and_then(PointerKind::parse)?;
    let area = value
        .get("area")
        .and_then(Value::as_str)
        .and_then(normalize_area)
        .unwrap_or_else(|| DEFAULT_AREA.to_string());

    Some(PointerCell {
        area,
        kind,
        x: grid_index(value.get("x"), GRID_WIDTH)?,
        y: grid_index(value.get("y"), GRID_HEIGHT)?,
        count: cell_count(value.get("count"))?,
    })
}

fn scroll_cell(value: &Value) -> Option<ScrollCell> {
    Some(ScrollCell {
        bucket: grid_index(value.get("bucket"), SCROLL_BUCKETS)?,
        count: cell_count(value.get("count"))?,
    })
}

fn grid_index(value: Option<&Value>, bound: usize) -> Option<u8> {
    let index = value?.as_u64()?;
    (index < bound as u64).then_some(index as u8)
}

fn cell_count(value: Option<&Value>) -> Option<u32> {
    let count = value?.as_u64()?;
    if count == 0 {
        return None;
    }
    Some(count.min(u64::from(MAX_CELL_COUNT)) as u32)
}
