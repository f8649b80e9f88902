//! Identity cache for session resolution.
//!
//! One explicit `CacheEntry { value, expires_at }` per user, checked and
//! invalidated through this accessor only. Avoids re-deriving the role (and
//! the rest of the identity row) from the users table on every request.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use uuid::Uuid;

use crate::db::UserSummary;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
const CACHE_CAPACITY: usize = 1024;

struct CacheEntry {
    value: UserSummary,
    expires_at: DateTime<Utc>,
}

pub struct IdentityCache {
    entries: Mutex<LruCache<Uuid, CacheEntry>>,
    ttl: Duration,
}

impl IdentityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero capacity"),
            )),
            ttl,
        }
    }

    /// Fresh entry or nothing; stale entries are evicted on access.
    pub fn get(&self, user_id: Uuid) -> Option<UserSummary> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(&user_id) {
            Some(entry) if entry.expires_at > Utc::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(&user_id);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, value: UserSummary) {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(1));
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.put(value.id, CacheEntry { value, expires_at });
    }

    pub fn invalidate(&self, user_id: Uuid) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.pop(&user_id);
    }
}
