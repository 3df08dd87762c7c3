use std::collections::HashMap;

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
pub const DEFAULT_TTL_SECS: i64 = 600;

/// Seen dispatch nonces with the request timestamp they arrived with.
///
/// Growth is bounded lazily: once an insert pushes the cache past
/// `max_entries`, every entry older than `ttl_secs` is evicted. Entries
/// inside the TTL are never dropped, so the cache may exceed the bound
/// under a burst of fresh requests.
#[derive(Debug)]
pub struct NonceCache {
    entries: HashMap<String, i64>,
    max_entries: usize,
    ttl_secs: i64,
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL_SECS)
    }
}

impl NonceCache {
    pub fn new(max_entries: usize, ttl_secs: i64) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries,
            ttl_secs,
        }
    }

    pub fn contains(&self, nonce: &str) -> bool {
        self.entries.contains_key(nonce)
    }

    pub fn insert(&mut self, nonce: String, timestamp: i64, now: i64) {
        self.entries.insert(nonce, timestamp);
        if self.entries.len() > self.max_entries {
            self.prune(now);
        }
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    pub fn prune(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl_secs;
        self.entries.retain(|_, seen| now - *seen <= ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
