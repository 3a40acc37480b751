//! Cache entries with optional expiry.
//!
//! Expiry is fixed at write time. Expired entries are removed lazily when
//! read, or in bulk by a cleanup sweep.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(value: Value, ttl_seconds: Option<u64>, now: DateTime<Utc>) -> Self {
        let expires_at = ttl_seconds.map(|ttl| {
            let ttl = Duration::try_seconds(ttl.min(i64::MAX as u64) as i64).unwrap_or(Duration::MAX);
            now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
        });
        Self { value, expires_at }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Read a stored cache document; values that are not cache entries are
    /// treated as non-expiring.
    pub fn from_stored(stored: Value) -> Self {
        match serde_json::from_value::<CacheEntry>(stored.clone()) {
            Ok(entry) if stored.get("value").is_some() => entry,
            _ => Self {
                value: stored,
                expires_at: None,
            },
        }
    }
}
