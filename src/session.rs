//! # Cache Session
//!
//! Per-unit-of-work execution context. Owns the unit-local cache layer, the
//! reentrant invalidation-suppression counter, and the deferred invalidation
//! queue a transaction host drives. One session belongs to one logical unit
//! (e.g. one inbound request); sessions are never shared across units, so
//! one unit suppressing invalidation cannot silently suppress another's.

use crate::local::{now_epoch, LocalEntry};
use crate::model::ChangedFields;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

pub struct CacheSession {
    read_only: bool,
    entries: Mutex<HashMap<String, LocalEntry>>,
    suppress_depth: AtomicU32,
    /// `Some` while a transaction host has deferral active.
    deferred: Mutex<Option<Vec<ChangedFields>>>,
}

impl CacheSession {
    pub(crate) fn new(read_only: bool) -> Self {
        Self {
            read_only,
            entries: Mutex::new(HashMap::new()),
            suppress_depth: AtomicU32::new(0),
            deferred: Mutex::new(None),
        }
    }

    /// Whether the host marked this unit's operation read-only-safe. The
    /// unit-local layer only serves reads when this is set.
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = now_epoch();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.live(now) => Some(entry.payload.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub(crate) fn set(&self, key: impl Into<String>, entry: LocalEntry) {
        self.entries.lock().insert(key.into(), entry);
    }

    pub(crate) fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Enter an invalidation-suppressed region. Reentrant: N guards must
    /// drop before invalidation resumes. The guard decrements on every exit
    /// path, including unwinding.
    pub fn suppress_invalidation(&self) -> SuppressionGuard<'_> {
        self.suppress_depth.fetch_add(1, Ordering::SeqCst);
        SuppressionGuard { session: self }
    }

    pub fn invalidation_suppressed(&self) -> bool {
        self.suppress_depth.load(Ordering::SeqCst) > 0
    }

    /// Start deferring invalidations until [`Self::take_deferred`] (commit)
    /// or [`Self::discard_deferred`] (rollback). Idempotent.
    pub fn begin_deferred(&self) {
        let mut deferred = self.deferred.lock();
        if deferred.is_none() {
            *deferred = Some(Vec::new());
        }
    }

    pub fn deferring(&self) -> bool {
        self.deferred.lock().is_some()
    }

    /// Queue a mutation if deferral is active; returns whether it was queued.
    pub(crate) fn enqueue_deferred(&self, changed: ChangedFields) -> bool {
        match self.deferred.lock().as_mut() {
            Some(queue) => {
                queue.push(changed);
                true
            }
            None => false,
        }
    }

    /// Drain the queue for an atomic flush at commit, ending deferral.
    pub fn take_deferred(&self) -> Vec<ChangedFields> {
        self.deferred.lock().take().unwrap_or_default()
    }

    /// Drop all queued invalidations (rollback), ending deferral.
    pub fn discard_deferred(&self) {
        *self.deferred.lock() = None;
    }

    /// Unit boundary: drop unit-local state. Called at both begin and end.
    pub(crate) fn reset(&self) {
        self.clear();
        self.discard_deferred();
    }
}

/// RAII guard for a suppressed region.
pub struct SuppressionGuard<'a> {
    session: &'a CacheSession,
}

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        self.session.suppress_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppression_nests() {
        let session = CacheSession::new(true);
        assert!(!session.invalidation_suppressed());
        {
            let _outer = session.suppress_invalidation();
            {
                let _inner = session.suppress_invalidation();
                assert!(session.invalidation_suppressed());
            }
            // Inner exit is not enough to resume invalidation.
            assert!(session.invalidation_suppressed());
        }
        assert!(!session.invalidation_suppressed());
    }

    #[test]
    fn guard_decrements_on_unwind() {
        let session = CacheSession::new(true);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = session.suppress_invalidation();
            panic!("producer failed");
        }));
        assert!(result.is_err());
        assert!(!session.invalidation_suppressed());
    }

    #[test]
    fn deferred_queue_lifecycle() {
        let session = CacheSession::new(false);
        assert!(!session.enqueue_deferred(ChangedFields::new("users")));

        session.begin_deferred();
        assert!(session.enqueue_deferred(ChangedFields::new("users")));
        assert!(session.enqueue_deferred(ChangedFields::new("orders")));
        let queued = session.take_deferred();
        assert_eq!(queued.len(), 2);
        assert!(!session.deferring());

        session.begin_deferred();
        assert!(session.enqueue_deferred(ChangedFields::new("users")));
        session.discard_deferred();
        assert!(session.take_deferred().is_empty());
    }

    #[test]
    fn unit_entries_expire() {
        let session = CacheSession::new(true);
        session.set("k", LocalEntry::new(b"v".to_vec(), None));
        assert_eq!(session.get("k"), Some(b"v".to_vec()));
        session.set(
            "k",
            LocalEntry {
                payload: b"v".to_vec(),
                expires_at: Some(now_epoch().saturating_sub(1)),
            },
        );
        assert_eq!(session.get("k"), None);
    }
}
