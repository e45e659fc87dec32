//! Server-side viewer identity and the admin gate for read endpoints.

use crate::errors::AppError;
use axum::http::{HeaderMap, HeaderValue, header};
use uuid::Uuid;

pub const VIEWER_COOKIE: &str = "hm_vid";
const VIEWER_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 365;
pub const ADMIN_HEADER: &str = "x-admin-token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub id: String,
    /// True when the id was minted for this request and must be sent back.
    pub issued: bool,
}

impl Viewer {
    pub fn set_cookie(&self) -> Option<HeaderValue> {
        let cookie = format!(
            "{VIEWER_COOKIE}={}; Path=/; Max-Age={VIEWER_MAX_AGE_SECS}; SameSite=Lax; HttpOnly",
            self.id
        );
        HeaderValue::from_str(&cookie).ok()
    }
}

pub fn resolve_viewer(headers: &HeaderMap) -> Viewer {
    match cookie_value(headers, VIEWER_COOKIE) {
        Some(id) if is_viewer_id(&id) => Viewer { id, issued: false },
        _ => Viewer {
            id: Uuid::new_v4().simple().to_string(),
            issued: true,
        },
    }
}

fn is_viewer_id(value: &str) -> bool {
    value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
}

/// Passes when the request carries the configured token. With no token
/// configured nothing passes.
pub fn require_admin(headers: &HeaderMap, expected: Option<&str>) -> Result<(), AppError> {
    let Some(expected) = expected else {
        return Err(AppError::unauthorized("admin access is not configured"));
    };

    let provided = headers
        .get(ADMIN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().strip_prefix("Bearer "))
                .map(str::trim)
        });

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(AppError::unauthorized("admin token required")),
    }
}
