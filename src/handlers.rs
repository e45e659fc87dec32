use crate::errors::AppError;
use crate::grid::ViewportBucket;
use crate::identity::{require_admin, resolve_viewer};
use crate::ingest::parse_batch;
use crate::models::{IngestResponse, SnapshotResponse, SummaryResponse};
use crate::state::AppState;
use crate::stats::{bucket_grid, build_summary, parse_limit};
use axum::{
    body::Bytes,
    extract::{Query, State, rejection::QueryRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::debug;

pub async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let batch = parse_batch(&body)?;
    let viewer = resolve_viewer(&headers);

    let outcome = state.store.record(&batch, &viewer.id).await?;
    debug!(
        slug = %batch.slug,
        viewport = batch.viewport.as_str(),
        cells = batch.cell_count(),
        new_viewer = outcome.new_viewer,
        "heatmap batch recorded"
    );

    let backend = if outcome.stored {
        state.store.backend().name().map(str::to_string)
    } else {
        None
    };
    let mut response = Json(IngestResponse {
        ok: true,
        count: batch.cell_count(),
        slug: batch.slug,
        stored: outcome.stored,
        backend,
    })
    .into_response();

    if viewer.issued {
        if let Some(cookie) = viewer.set_cookie() {
            response.headers_mut().insert(header::SET_COOKIE, cookie);
        }
    }

    Ok(response)
}

pub async fn ingest_method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST")],
        Json(json!({ "error": "method not allowed" })),
    )
        .into_response()
}

/// Raw query pairs, so `?slug=a&slug=b` is accepted alongside `?slug=a,b`.
type QueryPairs = Result<Query<Vec<(String, String)>>, QueryRejection>;

fn query_pairs(query: QueryPairs) -> Result<Vec<(String, String)>, AppError> {
    query
        .map(|Query(pairs)| pairs)
        .map_err(|rejection| AppError::bad_request(rejection.body_text()))
}

fn values<'a>(pairs: &'a [(String, String)], key: &'a str) -> impl Iterator<Item = &'a str> {
    pairs
        .iter()
        .filter(move |(name, _)| name == key)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

pub async fn snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: QueryPairs,
) -> Result<Json<SnapshotResponse>, AppError> {
    require_admin(&headers, state.config.admin_token.as_deref())?;
    let pairs = query_pairs(query)?;

    let Some(slug) = values(&pairs, "slug").next() else {
        return Err(AppError::bad_request("slug is required"));
    };
    let filter = match values(&pairs, "bucket").next() {
        Some(label) => Some(ViewportBucket::from_label(label).ok_or_else(|| {
            AppError::bad_request(format!("unknown viewport bucket: {label}"))
        })?),
        None => None,
    };

    let buckets = state
        .store
        .slug_buckets(slug, filter)
        .await
        .iter()
        .map(|(viewport, bucket)| bucket_grid(*viewport, bucket))
        .collect();

    Ok(Json(SnapshotResponse {
        slug: slug.to_string(),
        buckets,
    }))
}

pub async fn summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: QueryPairs,
) -> Result<Json<SummaryResponse>, AppError> {
    require_admin(&headers, state.config.admin_token.as_deref())?;
    let pairs = query_pairs(query)?;

    let limit = parse_limit(values(&pairs, "limit").last());
    let available_slugs = state.store.slugs().await;

    let requested: BTreeSet<String> = values(&pairs, "slug")
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|slug| !slug.is_empty())
        .map(str::to_string)
        .collect();
    let selected: Vec<String> = if requested.is_empty() {
        available_slugs.clone()
    } else {
        requested.into_iter().collect()
    };

    let mut slugs = Vec::with_capacity(selected.len());
    for slug in &selected {
        let buckets = state.store.slug_buckets(slug, None).await;
        slugs.push(build_summary(slug, &buckets, limit));
    }

    Ok(Json(SummaryResponse {
        slugs,
        generated_at: Utc::now().to_rfc3339(),
        available_slugs,
    }))
}
