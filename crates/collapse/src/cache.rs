//! TTL-bounded result cache: fingerprint → published outcome.

use std::collections::HashMap;
use std::hash::Hash;

use tokio::time::Instant;

use crate::error::Outcome;

/// A published outcome together with its expiry deadline.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub outcome: Outcome,
    pub expires_at: Instant,
}

/// Plain map of published outcomes.
///
/// Locking is owned by the engine: lookups run under its shared guard,
/// publication and eviction under the exclusive guard, so the map itself
/// stays synchronization-free. Entries never check their own expiry.
/// The coordinator compares `expires_at` against a single freshly sampled
/// timestamp so one request makes one "fresh enough?" decision.
#[derive(Debug)]
pub(crate) struct ResultCache<K> {
    entries: HashMap<K, CacheEntry>,
}

impl<K: Eq + Hash> ResultCache<K> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Raw lookup, expired entries included.
    pub fn lookup(&self, key: &K) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert or overwrite. Returns `true` if the fingerprint was not
    /// previously cached, so the caller can keep the live-entry gauge exact
    /// when an expired-but-unswept entry gets replaced.
    pub fn publish(&mut self, key: K, outcome: Outcome, expires_at: Instant) -> bool {
        self.entries
            .insert(
                key,
                CacheEntry {
                    outcome,
                    expires_at,
                },
            )
            .is_none()
    }

    /// Drop every entry with `expires_at <= now`. Returns the eviction count.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    /// Drop everything. Returns the number of entries removed.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
