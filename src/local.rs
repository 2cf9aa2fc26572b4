//! # Local Cache Layers
//!
//! Read-through layers in front of the remote store. Neither is
//! authoritative: a miss or disabled layer falls through to the remote store
//! with no behavior change. The process layer here is shared by all
//! execution units in one process and must be constructed explicitly at
//! process bootstrap and passed by reference, never embedded as a shared
//! mutable default. The unit-of-work layer lives on
//! [`crate::session::CacheSession`].

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time as epoch seconds.
pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A locally cached copy of a remote entry's payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub payload: Vec<u8>,
    /// Absolute expiry in epoch seconds; `None` never expires.
    pub expires_at: Option<u64>,
}

impl LocalEntry {
    pub fn new(payload: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            payload,
            expires_at: ttl.map(|t| now_epoch() + t.as_secs().max(1)),
        }
    }

    pub fn live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Process-lifetime local layer, LRU-bounded, cleared wholesale on any
/// process-wide invalidation signal.
pub struct ProcessCache {
    entries: Mutex<LruCache<String, LocalEntry>>,
}

impl ProcessCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = now_epoch();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.live(now) => Some(entry.payload.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: impl Into<String>, entry: LocalEntry) {
        self.entries.lock().put(key.into(), entry);
    }

    pub fn delete(&self, key: &str) {
        self.entries.lock().pop(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_live_entries_only() {
        let cache = ProcessCache::new(16);
        cache.set("fresh", LocalEntry::new(b"a".to_vec(), None));
        cache.set(
            "stale",
            LocalEntry {
                payload: b"b".to_vec(),
                expires_at: Some(now_epoch().saturating_sub(1)),
            },
        );
        assert_eq!(cache.get("fresh"), Some(b"a".to_vec()));
        assert_eq!(cache.get("stale"), None);
        // Stale entry was evicted on read.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_drops_everything() {
        let cache = ProcessCache::new(16);
        cache.set("a", LocalEntry::new(b"1".to_vec(), None));
        cache.set("b", LocalEntry::new(b"2".to_vec(), None));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn capacity_bounds_the_layer() {
        let cache = ProcessCache::new(2);
        cache.set("a", LocalEntry::new(b"1".to_vec(), None));
        cache.set("b", LocalEntry::new(b"2".to_vec(), None));
        cache.set("c", LocalEntry::new(b"3".to_vec(), None));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn delete_is_exact() {
        let cache = ProcessCache::new(16);
        cache.set("a", LocalEntry::new(b"1".to_vec(), None));
        cache.set("b", LocalEntry::new(b"2".to_vec(), None));
        cache.delete("a");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(b"2".to_vec()));
    }
}
