//! Per-slug session tokens kept in session-scoped storage.

use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

const TOKEN_BYTES: usize = 16;

#[derive(Debug, Error)]
#[error("session storage unavailable: {0}")]
pub struct StorageError(pub String);

/// Browser `sessionStorage`, or anything with the same contract.
pub trait SessionStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    values: Mutex<HashMap<String, String>>,
}

impl SessionStorage for MemorySessionStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self
            .values
            .lock()
            .map_err(|err| StorageError(err.to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self
            .values
            .lock()
            .map_err(|err| StorageError(err.to_string()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

pub fn session_key(slug: &str) -> String {
    format!("heatmap:session:{slug}")
}

/// Returns the cached token for `slug`, minting one if needed. Storage
/// failures still yield a token, it just won't survive the page.
pub fn resolve_session_id<S: SessionStorage + ?Sized>(storage: &S, slug: &str) -> String {
    let key = session_key(slug);
    match storage.get(&key) {
        Ok(Some(existing)) if is_session_token(&existing) => return existing,
        Ok(_) => {}
        Err(err) => debug!("session lookup failed: {err}"),
    }

    let token = generate_token();
    if let Err(err) = storage.set(&key, &token) {
        debug!("session token not persisted: {err}");
    }
    token
}

pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    if let Err(err) = OsRng.try_fill_bytes(&mut bytes) {
        debug!("os randomness unavailable, using seeded fallback: {err}");
        fallback_fill(&mut bytes);
    }
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn fallback_fill(bytes: &mut [u8]) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();
    let seed = nanos ^ (u64::from(std::process::id()) << 32);
    StdRng::seed_from_u64(seed).fill_bytes(bytes);
}

fn is_session_token(value: &str) -> bool {
    value.len() == TOKEN_BYTES * 2 && value.bytes().all(|b| b.is_ascii_hexdigit())
}
