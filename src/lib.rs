//! # relcache
//!
//! A read-through cache for parameterized query results with *exact*
//! invalidation: when a record changes, only the cached results whose query
//! could have been affected are evicted, never a blanket flush.
//!
//! Cached results register the predicate conjunctions that justify them; a
//! record mutation atomically finds and deletes every result whose
//! conjunctions it satisfies. Concurrent recomputation of the same missing
//! entry is prevented by a distributed lock with waiter wake-up, and all
//! multi-key atomic operations stay valid on a sharded backing store via
//! co-location tags.
//!
//! # Example
//!
//! ```
//! use relcache::{CacheConfig, ChangedFields, Conjunction, Disjunction, FieldValue, RelCache};
//!
//! let cache = RelCache::new(CacheConfig::default()).unwrap();
//! let deps = Disjunction::single(Conjunction::new(
//!     "users",
//!     vec![FieldValue::new("id", 42)],
//! ));
//!
//! let value: u64 = cache
//!     .get_or_compute(None, "users:q:42", &deps, None, || Ok(7))
//!     .unwrap();
//! assert_eq!(value, 7);
//!
//! // A mutation matching the conjunction evicts the entry.
//! cache
//!     .invalidate_record(None, &ChangedFields::new("users").with("id", 42))
//!     .unwrap();
//! ```

pub mod cluster;
pub mod codec;
pub mod config;
pub mod invalidation;
pub mod local;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod remote;
pub mod session;

pub use cluster::{ShardRouter, TopologyError};
pub use codec::CodecError;
pub use config::{CacheConfig, ConfigError, ConfigOverrides};
pub use invalidation::{InvalidationEngine, InvalidationEvent};
pub use local::ProcessCache;
pub use lock::{LockOutcome, StampedeGuard};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use model::{ChangedFields, Conjunction, Disjunction, FieldValue, ScalarValue};
pub use remote::{
    ConnectivityError, InvalidationOutcome, MemoryCluster, RemoteStore, RemoteValue,
};
pub use session::{CacheSession, SuppressionGuard};

use crate::local::LocalEntry;
use anyhow::Result;
use regex::RegexSet;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-call cache policy for [`RelCache::get_or_compute_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Serve from cache layers, computing and storing on miss.
    ReadThrough,
    /// Skip every cache layer and compute directly. The caller opted this
    /// call out; nothing is read, stored, or registered.
    Bypass,
}

/// Main API: the cache engine facade.
///
/// Construct once at process bootstrap and share by reference; the process
/// layer's lifetime is the engine's lifetime.
pub struct RelCache {
    config: CacheConfig,
    store: Arc<dyn RemoteStore>,
    router: Arc<ShardRouter>,
    process: Arc<ProcessCache>,
    guard: StampedeGuard,
    invalidation: InvalidationEngine,
    metrics: Arc<EngineMetrics>,
    exclude: RegexSet,
}

impl RelCache {
    /// Create an engine backed by an in-memory cluster built from the
    /// configured topology descriptor.
    pub fn new(config: CacheConfig) -> Result<Self> {
        let store = Arc::new(MemoryCluster::with_nodes(config.cluster.nodes.clone()));
        Self::with_store(config, store)
    }

    /// Create an engine on a caller-supplied backing store.
    ///
    /// Fails if the topology cannot be covered with co-location tags or the
    /// exclude patterns do not compile; both are startup faults, the only
    /// kind this subsystem propagates.
    pub fn with_store(config: CacheConfig, store: Arc<dyn RemoteStore>) -> Result<Self> {
        let router = Arc::new(ShardRouter::new(store.clone())?);
        let metrics = Arc::new(EngineMetrics::default());
        let process = Arc::new(ProcessCache::new(config.local.process_capacity));
        let exclude = config.local.exclude_set()?;
        let guard = StampedeGuard::new(store.clone(), metrics.clone(), config.lock_ttl());
        let invalidation = InvalidationEngine::new(
            store.clone(),
            router.clone(),
            process.clone(),
            metrics.clone(),
            config.max_scan,
            config.script_deadline(),
        );
        Ok(Self {
            config,
            store,
            router,
            process,
            guard,
            invalidation,
            metrics,
            exclude,
        })
    }

    // ------------------------------------------------------------------
    // Unit-of-work lifecycle
    // ------------------------------------------------------------------

    /// Begin a unit of work. The host declares whether the unit's operation
    /// is read-only-safe; only such units are served from the unit layer.
    pub fn begin_unit(&self, read_only: bool) -> CacheSession {
        CacheSession::new(read_only)
    }

    /// End a unit of work, dropping its local state and any deferred queue.
    pub fn end_unit(&self, session: &CacheSession) {
        session.reset();
    }

    // ------------------------------------------------------------------
    // Read-through path
    // ------------------------------------------------------------------

    /// Read `key` through every layer, or compute it as the sole producer.
    ///
    /// On a remote miss the caller either acquires the stampede lock and
    /// produces the value (storing it and registering its dependency set),
    /// or waits for the producer's signal and retries. Lock trouble is never
    /// fatal: under the fail-open policy a connectivity fault downgrades to
    /// a direct computation without caching benefit.
    pub fn get_or_compute<T, F>(
        &self,
        session: Option<&CacheSession>,
        key: &str,
        deps: &Disjunction,
        ttl: Option<Duration>,
        produce: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        if !self.config.enabled {
            return produce();
        }

        let full_key = self.storage_key(key, deps)?;

        if let Some(session) = session {
            if self.unit_layer_active(session, key) {
                if let Some(bytes) = session.get(&full_key) {
                    if let Some(value) = self.decode_local(&bytes, &full_key, Some(session)) {
                        EngineMetrics::incr(&self.metrics.local_hits);
                        return Ok(value);
                    }
                }
            }
        }

        if let Some(bytes) = self.process.get(&full_key) {
            if let Some(value) = self.decode_local(&bytes, &full_key, session) {
                EngineMetrics::incr(&self.metrics.local_hits);
                self.fill_unit_layer(session, key, &full_key, &bytes, ttl);
                return Ok(value);
            }
        }

        let outcome = match self.guard.get_or_acquire(&full_key) {
            Ok(outcome) => outcome,
            Err(e) if self.fail_open(&e) => {
                self.note_degraded("get_or_acquire", &e);
                return produce();
            }
            Err(e) => return Err(e),
        };

        match outcome {
            LockOutcome::Value {
                payload,
                ttl: remaining,
            } => {
                EngineMetrics::incr(&self.metrics.remote_hits);
                match codec::decode::<T>(&payload) {
                    Ok(value) => {
                        self.fill_local_layers(session, key, &full_key, &payload, remaining);
                        Ok(value)
                    }
                    Err(e) => {
                        // Corrupt or incompatible payload: a miss, not a
                        // failure. Recompute without lock involvement.
                        EngineMetrics::incr(&self.metrics.decode_failures);
                        debug!(key = %full_key, error = %e, "discarding undecodable payload");
                        EngineMetrics::incr(&self.metrics.misses);
                        let value = produce()?;
                        self.store_computed(session, key, &full_key, deps, ttl, &value)?;
                        Ok(value)
                    }
                }
            }
            LockOutcome::Acquired => {
                EngineMetrics::incr(&self.metrics.misses);
                let result = produce().and_then(|value| {
                    self.store_computed(session, key, &full_key, deps, ttl, &value)?;
                    Ok(value)
                });
                // Success or failure, waiters must be woken.
                if let Err(e) = self.guard.release(&full_key) {
                    warn!(key = %full_key, error = %e, "lock release failed");
                }
                result
            }
        }
    }

    /// [`Self::get_or_compute`] with an explicit per-call policy.
    pub fn get_or_compute_with<T, F>(
        &self,
        session: Option<&CacheSession>,
        key: &str,
        deps: &Disjunction,
        ttl: Option<Duration>,
        policy: CachePolicy,
        produce: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        match policy {
            CachePolicy::Bypass => produce(),
            CachePolicy::ReadThrough => self.get_or_compute(session, key, deps, ttl, produce),
        }
    }

    /// Simple surface: read a plain value, no locking, no registration.
    pub fn get<T: DeserializeOwned>(
        &self,
        session: Option<&CacheSession>,
        key: &str,
    ) -> Result<Option<T>> {
        if !self.config.enabled {
            return Ok(None);
        }
        if let Some(session) = session {
            if self.unit_layer_active(session, key) {
                if let Some(bytes) = session.get(key) {
                    if let Some(value) = self.decode_local(&bytes, key, Some(session)) {
                        EngineMetrics::incr(&self.metrics.local_hits);
                        return Ok(Some(value));
                    }
                }
            }
        }
        if let Some(bytes) = self.process.get(key) {
            if let Some(value) = self.decode_local(&bytes, key, session) {
                EngineMetrics::incr(&self.metrics.local_hits);
                return Ok(Some(value));
            }
        }

        let remote = match self.store.get(key) {
            Ok(remote) => remote,
            Err(e) if self.fail_open(&e) => {
                self.note_degraded("get", &e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match remote {
            RemoteValue::Value { payload, ttl } => match codec::decode::<T>(&payload) {
                Ok(value) => {
                    EngineMetrics::incr(&self.metrics.remote_hits);
                    self.fill_local_layers(session, key, key, &payload, ttl);
                    Ok(Some(value))
                }
                Err(e) => {
                    EngineMetrics::incr(&self.metrics.decode_failures);
                    debug!(key, error = %e, "discarding undecodable payload");
                    EngineMetrics::incr(&self.metrics.misses);
                    Ok(None)
                }
            },
            RemoteValue::Locked | RemoteValue::Missing => {
                EngineMetrics::incr(&self.metrics.misses);
                Ok(None)
            }
        }
    }

    /// Simple surface: write a plain value through all layers.
    pub fn set<T: Serialize>(
        &self,
        session: Option<&CacheSession>,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let bytes = codec::encode(value)?;
        match self.store.set(key, bytes.clone(), ttl) {
            Ok(()) => {}
            Err(e) if self.fail_open(&e) => {
                self.note_degraded("set", &e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        EngineMetrics::incr(&self.metrics.sets);
        self.fill_local_layers(session, key, key, &bytes, ttl);
        Ok(())
    }

    /// Simple surface: delete a plain value from all layers.
    pub fn delete(&self, session: Option<&CacheSession>, key: &str) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        match self.store.delete(key) {
            Ok(_) => {}
            Err(e) if self.fail_open(&e) => self.note_degraded("delete", &e),
            Err(e) => return Err(e),
        }
        self.process.delete(key);
        if let Some(session) = session {
            session.delete(key);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Invalidation surface
    // ------------------------------------------------------------------

    /// Invalidate everything a record mutation could have affected.
    pub fn invalidate_record(
        &self,
        session: Option<&CacheSession>,
        changed: &ChangedFields,
    ) -> Result<InvalidationOutcome> {
        if !self.config.enabled {
            return Ok(InvalidationOutcome::default());
        }
        match self.invalidation.invalidate_record(session, changed) {
            Ok(outcome) => Ok(outcome),
            Err(e) if self.fail_open(&e) => {
                self.note_degraded("invalidate_record", &e);
                self.drop_local_layers(session);
                Ok(InvalidationOutcome::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Invalidate all cached results depending on `table`.
    pub fn invalidate_table(
        &self,
        session: Option<&CacheSession>,
        table: &str,
    ) -> Result<Vec<String>> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }
        match self.invalidation.invalidate_table(session, table) {
            Ok(deleted) => Ok(deleted),
            Err(e) if self.fail_open(&e) => {
                self.note_degraded("invalidate_table", &e);
                self.drop_local_layers(session);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Flush the entire cache.
    pub fn invalidate_all(&self, session: Option<&CacheSession>) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        match self.invalidation.invalidate_all(session) {
            Ok(()) => Ok(()),
            Err(e) if self.fail_open(&e) => {
                self.note_degraded("invalidate_all", &e);
                self.drop_local_layers(session);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Flush a session's deferred invalidation queue at transaction commit.
    pub fn flush_deferred(&self, session: &CacheSession) -> Result<InvalidationOutcome> {
        match self.invalidation.flush_deferred(session) {
            Ok(outcome) => Ok(outcome),
            Err(e) if self.fail_open(&e) => {
                self.note_degraded("flush_deferred", &e);
                self.drop_local_layers(Some(session));
                Ok(InvalidationOutcome::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Register an invalidation observer.
    pub fn on_invalidated(&self, callback: impl Fn(&InvalidationEvent) + Send + Sync + 'static) {
        self.invalidation.on_invalidated(callback);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// The stored key: tagged to co-locate with the primary table's
    /// registrations, or the bare key when there is nothing to register.
    fn storage_key(&self, key: &str, deps: &Disjunction) -> Result<String> {
        match deps.primary_table() {
            Some(table) => Ok(self.router.key_for(table, key)?),
            None => Ok(key.to_string()),
        }
    }

    fn unit_layer_active(&self, session: &CacheSession, resource: &str) -> bool {
        session.read_only() && !self.exclude.is_match(resource)
    }

    /// Decode a local-layer payload; undecodable copies are evicted so they
    /// cannot shadow a good remote value.
    fn decode_local<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        full_key: &str,
        session: Option<&CacheSession>,
    ) -> Option<T> {
        match codec::decode(bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                EngineMetrics::incr(&self.metrics.decode_failures);
                debug!(key = %full_key, error = %e, "evicting undecodable local copy");
                self.process.delete(full_key);
                if let Some(session) = session {
                    session.delete(full_key);
                }
                None
            }
        }
    }

    fn fill_unit_layer(
        &self,
        session: Option<&CacheSession>,
        resource: &str,
        full_key: &str,
        bytes: &[u8],
        ttl: Option<Duration>,
    ) {
        if let Some(session) = session {
            if self.unit_layer_active(session, resource) {
                session.set(full_key, LocalEntry::new(bytes.to_vec(), ttl));
            }
        }
    }

    fn fill_local_layers(
        &self,
        session: Option<&CacheSession>,
        resource: &str,
        full_key: &str,
        bytes: &[u8],
        ttl: Option<Duration>,
    ) {
        self.process
            .set(full_key, LocalEntry::new(bytes.to_vec(), ttl));
        self.fill_unit_layer(session, resource, full_key, bytes, ttl);
    }

    /// Store a freshly produced value and register its dependency set.
    fn store_computed<T: Serialize>(
        &self,
        session: Option<&CacheSession>,
        resource: &str,
        full_key: &str,
        deps: &Disjunction,
        ttl: Option<Duration>,
        value: &T,
    ) -> Result<()> {
        let bytes = codec::encode(value)?;
        match self.store.set(full_key, bytes.clone(), ttl) {
            Ok(()) => {}
            Err(e) if self.fail_open(&e) => {
                self.note_degraded("set", &e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        EngineMetrics::incr(&self.metrics.sets);
        if let Some(table) = deps.primary_table() {
            let tag = self.router.tag_for_table(table)?;
            match self.invalidation.register(&tag, full_key, deps, ttl) {
                Ok(()) => {}
                // A result stored without registrations could never be
                // invalidated; drop it on every failure path.
                Err(e) if self.fail_open(&e) => {
                    self.note_degraded("register", &e);
                    let _ = self.store.delete(full_key);
                    return Ok(());
                }
                Err(e) => {
                    let _ = self.store.delete(full_key);
                    return Err(e);
                }
            }
        }
        self.fill_local_layers(session, resource, full_key, &bytes, ttl);
        Ok(())
    }

    /// A degraded invalidation cannot know which keys would have matched, so
    /// the local layers are cleared wholesale: stale local copies must not
    /// outlive an invalidation the caller asked for.
    fn drop_local_layers(&self, session: Option<&CacheSession>) {
        self.process.clear();
        if let Some(session) = session {
            session.clear();
        }
    }

    fn fail_open(&self, e: &anyhow::Error) -> bool {
        self.config.degrade_on_failure && e.downcast_ref::<ConnectivityError>().is_some()
    }

    fn note_degraded(&self, op: &str, e: &anyhow::Error) {
        EngineMetrics::incr(&self.metrics.degraded_ops);
        warn!(op, error = %e, "cache store unreachable; degrading to pass-through");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(id: i64) -> Disjunction {
        Disjunction::single(Conjunction::new("users", vec![FieldValue::new("id", id)]))
    }

    #[test]
    fn disabled_engine_always_computes() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let cache = RelCache::new(config).unwrap();
        let mut calls = 0;
        for _ in 0..2 {
            let v: u64 = cache
                .get_or_compute(None, "q", &deps(1), None, || {
                    calls += 1;
                    Ok(9)
                })
                .unwrap();
            assert_eq!(v, 9);
        }
        assert_eq!(calls, 2);
    }

    #[test]
    fn disabled_engine_leaves_the_store_alone() {
        let store = Arc::new(MemoryCluster::new(1));
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let cache = RelCache::with_store(config, store.clone()).unwrap();
        store
            .set("k", codec::encode(&1u64).unwrap(), None)
            .unwrap();

        cache.delete(None, "k").unwrap();
        assert!(matches!(store.get("k").unwrap(), RemoteValue::Value { .. }));
        // Reads are equally inert while disabled.
        assert_eq!(cache.get::<u64>(None, "k").unwrap(), None);
    }

    #[test]
    fn second_read_is_a_hit() {
        let cache = RelCache::new(CacheConfig::default()).unwrap();
        let v1: u64 = cache
            .get_or_compute(None, "q", &deps(1), None, || Ok(5))
            .unwrap();
        let v2: u64 = cache
            .get_or_compute(None, "q", &deps(1), None, || {
                panic!("should be served from cache")
            })
            .unwrap();
        assert_eq!(v1, v2);
        let snap = cache.metrics();
        assert_eq!(snap.misses, 1);
        assert!(snap.local_hits >= 1);
    }

    #[test]
    fn producer_error_propagates_and_releases_lock() {
        let cache = RelCache::new(CacheConfig::default()).unwrap();
        let err = cache
            .get_or_compute::<u64, _>(None, "q", &deps(1), None, || {
                Err(anyhow::anyhow!("backend down"))
            })
            .unwrap_err();
        assert!(err.to_string().contains("backend down"));
        // The failed producer must not leave the key locked.
        let v: u64 = cache
            .get_or_compute(None, "q", &deps(1), None, || Ok(3))
            .unwrap();
        assert_eq!(v, 3);
    }

    #[test]
    fn bypass_policy_skips_every_layer() {
        let cache = RelCache::new(CacheConfig::default()).unwrap();
        let _: u64 = cache
            .get_or_compute(None, "q", &deps(1), None, || Ok(5))
            .unwrap();
        // Bypass ignores the cached 5 and does not overwrite it.
        let v: u64 = cache
            .get_or_compute_with(None, "q", &deps(1), None, CachePolicy::Bypass, || Ok(8))
            .unwrap();
        assert_eq!(v, 8);
        let v: u64 = cache
            .get_or_compute(None, "q", &deps(1), None, || unreachable!())
            .unwrap();
        assert_eq!(v, 5);
    }

    #[test]
    fn undecodable_payload_is_recomputed() {
        let cache = RelCache::new(CacheConfig::default()).unwrap();
        let full_key = cache.storage_key("q", &deps(1)).unwrap();
        cache.store.set(&full_key, vec![0xff, 1, 2], None).unwrap();

        let v: u64 = cache
            .get_or_compute(None, "q", &deps(1), None, || Ok(4))
            .unwrap();
        assert_eq!(v, 4);
        assert_eq!(cache.metrics().decode_failures, 1);

        // The recomputation replaced the bad payload.
        let v: u64 = cache
            .get_or_compute(None, "q", &deps(1), None, || unreachable!())
            .unwrap();
        assert_eq!(v, 4);
    }

    #[test]
    fn simple_surface_roundtrip() {
        let cache = RelCache::new(CacheConfig::default()).unwrap();
        assert_eq!(cache.get::<String>(None, "plain").unwrap(), None);
        cache
            .set(None, "plain", &"hello".to_string(), None)
            .unwrap();
        assert_eq!(
            cache.get::<String>(None, "plain").unwrap(),
            Some("hello".to_string())
        );
        cache.delete(None, "plain").unwrap();
        assert_eq!(cache.get::<String>(None, "plain").unwrap(), None);
    }

    #[test]
    fn unit_layer_gated_by_read_only_flag() {
        let cache = RelCache::new(CacheConfig::default()).unwrap();
        let writer = cache.begin_unit(false);
        assert!(!cache.unit_layer_active(&writer, "users:q"));
        let reader = cache.begin_unit(true);
        assert!(cache.unit_layer_active(&reader, "users:q"));
        cache.end_unit(&reader);
        cache.end_unit(&writer);
    }

    #[test]
    fn unit_layer_gated_by_exclude_pattern() {
        let config = CacheConfig {
            local: config::LocalConfig {
                exclude: vec!["^session:".to_string()],
                ..config::LocalConfig::default()
            },
            ..CacheConfig::default()
        };
        let cache = RelCache::new(config).unwrap();
        let session = cache.begin_unit(true);
        assert!(!cache.unit_layer_active(&session, "session:abc"));
        assert!(cache.unit_layer_active(&session, "users:q"));
    }
}
