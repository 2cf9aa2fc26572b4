//! # Invalidation Engine
//!
//! Tracks, per cached result, which predicate conjunctions justify its
//! validity, and on a record mutation atomically finds and deletes every
//! result whose conjunctions the mutated record satisfies. The find-and-
//! delete runs server-side per shard; a client-side read-then-delete would
//! let a registration racing the delete survive with stale data.

use crate::cluster::ShardRouter;
use crate::local::ProcessCache;
use crate::metrics::EngineMetrics;
use crate::model::{ChangedFields, Disjunction};
use crate::remote::{InvalidationOutcome, RemoteStore};
use crate::session::CacheSession;
use anyhow::Result;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What an invalidation callback observes.
#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    /// The mutated table, `None` for a global flush.
    pub table: Option<String>,
    pub entries_deleted: usize,
}

type InvalidationCallback = Box<dyn Fn(&InvalidationEvent) + Send + Sync>;

pub struct InvalidationEngine {
    store: Arc<dyn RemoteStore>,
    router: Arc<ShardRouter>,
    process: Arc<ProcessCache>,
    metrics: Arc<EngineMetrics>,
    max_scan: usize,
    script_deadline: Duration,
    callbacks: RwLock<Vec<InvalidationCallback>>,
}

impl InvalidationEngine {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        router: Arc<ShardRouter>,
        process: Arc<ProcessCache>,
        metrics: Arc<EngineMetrics>,
        max_scan: usize,
        script_deadline: Duration,
    ) -> Self {
        Self {
            store,
            router,
            process,
            metrics,
            max_scan,
            script_deadline,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Register a cached entry under every conjunction of its dependency
    /// set. `tag` is the entry key's own co-location tag, so all
    /// registrations land on the entry's shard in one atomic step.
    pub fn register(
        &self,
        tag: &str,
        entry_key: &str,
        disjunction: &Disjunction,
        ttl: Option<Duration>,
    ) -> Result<()> {
        if disjunction.is_empty() {
            return Ok(());
        }
        self.store.register(tag, entry_key, &disjunction.0, ttl)
    }

    /// Invalidate everything a record mutation could have affected.
    ///
    /// Runs the atomic invalidation pass on every shard: registrations are
    /// stored under the tag of the query that created them, so a table's
    /// registrations can live on any shard. Suppressed sessions skip
    /// entirely; deferring sessions queue the mutation for commit.
    pub fn invalidate_record(
        &self,
        session: Option<&CacheSession>,
        changed: &ChangedFields,
    ) -> Result<InvalidationOutcome> {
        if session.is_some_and(CacheSession::invalidation_suppressed) {
            debug!(table = %changed.table, "invalidation suppressed");
            return Ok(InvalidationOutcome::default());
        }
        if let Some(session) = session {
            if session.enqueue_deferred(changed.clone()) {
                debug!(table = %changed.table, "invalidation deferred");
                return Ok(InvalidationOutcome::default());
            }
        }

        let mut total = InvalidationOutcome::default();
        for tag in self.router.all_tags()? {
            let outcome =
                self.store
                    .invalidate(&tag, changed, self.max_scan, self.script_deadline)?;
            total.absorb(outcome);
        }

        EngineMetrics::incr(&self.metrics.invalidations);
        EngineMetrics::add(&self.metrics.entries_invalidated, total.deleted_keys.len() as u64);
        if total.truncated {
            EngineMetrics::incr(&self.metrics.scan_truncated);
            warn!(
                table = %changed.table,
                scanned = total.scanned,
                max_scan = self.max_scan,
                "registration scan truncated; some entries were not invalidated"
            );
        }

        self.evict_local(session, &total.deleted_keys);
        self.notify(&InvalidationEvent {
            table: Some(changed.table.clone()),
            entries_deleted: total.deleted_keys.len(),
        });
        Ok(total)
    }

    /// Invalidate every cached result depending on `table`, regardless of
    /// constraints. Heavy: sweeps the table's registration keyspace on every
    /// shard.
    pub fn invalidate_table(
        &self,
        session: Option<&CacheSession>,
        table: &str,
    ) -> Result<Vec<String>> {
        if session.is_some_and(CacheSession::invalidation_suppressed) {
            return Ok(Vec::new());
        }

        let mut deleted = Vec::new();
        for tag in self.router.all_tags()? {
            deleted.extend(self.store.invalidate_table(&tag, table)?);
        }

        EngineMetrics::incr(&self.metrics.invalidations);
        EngineMetrics::add(&self.metrics.entries_invalidated, deleted.len() as u64);
        self.evict_local(session, &deleted);
        self.notify(&InvalidationEvent {
            table: Some(table.to_string()),
            entries_deleted: deleted.len(),
        });
        Ok(deleted)
    }

    /// Flush the entire cache: remote store and both local layers.
    pub fn invalidate_all(&self, session: Option<&CacheSession>) -> Result<()> {
        if session.is_some_and(CacheSession::invalidation_suppressed) {
            return Ok(());
        }
        self.store.flush_all()?;
        self.process.clear();
        if let Some(session) = session {
            session.clear();
        }
        EngineMetrics::incr(&self.metrics.invalidations);
        self.notify(&InvalidationEvent {
            table: None,
            entries_deleted: 0,
        });
        Ok(())
    }

    /// Flush a session's deferred queue at commit. Mutations run in enqueue
    /// order against the live engine (no further deferral).
    pub fn flush_deferred(&self, session: &CacheSession) -> Result<InvalidationOutcome> {
        let mut total = InvalidationOutcome::default();
        for changed in session.take_deferred() {
            total.absorb(self.invalidate_record(None, &changed)?);
        }
        Ok(total)
    }

    /// Register an invalidation observer. Explicit registration only; the
    /// engine holds no ambient subscription to any event bus.
    pub fn on_invalidated(&self, callback: impl Fn(&InvalidationEvent) + Send + Sync + 'static) {
        self.callbacks.write().push(Box::new(callback));
    }

    fn evict_local(&self, session: Option<&CacheSession>, keys: &[String]) {
        for key in keys {
            self.process.delete(key);
        }
        // The unit layer is scoped to one request's view; any write to a
        // depended-on table makes that view suspect, so drop it wholesale.
        if let Some(session) = session {
            session.clear();
        }
    }

    fn notify(&self, event: &InvalidationEvent) {
        for callback in self.callbacks.read().iter() {
            callback(event);
        }
    }
}
