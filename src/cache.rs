use std::fmt;
use std::time::Duration;

use moka::sync::Cache;

pub const DEFAULT_MAX_ENTRIES: u64 = 1_000;

/// In-memory response bodies keyed by full request URL. Entries live for
/// `ttl` and the cache holds at most `max_entries` bodies.
#[derive(Clone)]
pub struct ResponseCache {
    ttl: Duration,
    entries: Cache<String, String>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        Self {
            ttl,
            entries: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key)
    }

    pub fn insert(&self, key: String, body: String) {
        self.entries.insert(key, body);
    }

    /// Approximate; pending evictions may not be reflected yet.
    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}
