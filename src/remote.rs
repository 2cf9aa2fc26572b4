//! # Remote Store
//!
//! The narrow contract between the cache engine and its backing key-value
//! store, plus an in-memory sharded implementation.
//!
//! Every race-sensitive mutation (invalidation, lock acquire/release) is a
//! single trait method executed atomically server-side. [`MemoryCluster`]
//! runs each op under the owning node's mutex, which is the in-process
//! equivalent of a server-side script; a networked backend would implement
//! the same trait with real atomic scripts. Client-side check-then-act
//! sequences are deliberately impossible to express through this interface.

use crate::model::{registration_key, registration_prefix, ChangedFields, Conjunction};
use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHasher;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How long a signal channel lives after a release pushes its wake token.
const SIGNAL_TTL: Duration = Duration::from_secs(1);

/// Store unreachable or timed out. Handled per the configured
/// fail-open/fail-closed policy, never left partially applied.
#[derive(Debug)]
pub struct ConnectivityError {
    pub message: String,
}

impl ConnectivityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConnectivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache store unreachable: {}", self.message)
    }
}

impl std::error::Error for ConnectivityError {}

/// Outcome of reading a data key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteValue {
    Missing,
    /// A producer holds the stampede lock for this key.
    Locked,
    Value {
        payload: Vec<u8>,
        /// Remaining time to live, `None` if the entry never expires.
        ttl: Option<Duration>,
    },
}

/// Result of one atomic invalidation pass on one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationOutcome {
    /// Registrations examined before the scan ended.
    pub scanned: usize,
    /// Registrations whose conjunction matched the mutation.
    pub matched: usize,
    /// Union of entry keys across matching registrations, all deleted.
    pub deleted_keys: Vec<String>,
    /// Scan stopped at `max_scan` or the deadline; un-scanned registrations
    /// were not invalidated.
    pub truncated: bool,
}

impl InvalidationOutcome {
    pub fn absorb(&mut self, other: InvalidationOutcome) {
        self.scanned += other.scanned;
        self.matched += other.matched;
        self.deleted_keys.extend(other.deleted_keys);
        self.truncated |= other.truncated;
    }
}

/// Atomic server-side operations the engine requires of its backing store.
pub trait RemoteStore: Send + Sync {
    fn get(&self, key: &str) -> Result<RemoteValue>;

    fn set(&self, key: &str, payload: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    fn delete(&self, key: &str) -> Result<bool>;

    /// Add `entry_key` to the registration of every conjunction, creating
    /// registrations as needed and extending their expiry to at least `ttl`.
    /// All registration keys carry `tag`, so the whole call lands on one
    /// shard and executes atomically. Idempotent.
    fn register(
        &self,
        tag: &str,
        entry_key: &str,
        conjunctions: &[Conjunction],
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Atomically scan this shard's registrations for the mutated table,
    /// delete every entry whose conjunction the mutation satisfies along with
    /// the matching registrations. Bounded by `max_scan` and `deadline`.
    fn invalidate(
        &self,
        tag: &str,
        changed: &ChangedFields,
        max_scan: usize,
        deadline: Duration,
    ) -> Result<InvalidationOutcome>;

    /// Delete every registration for `table` on this shard plus the union of
    /// their member entries. Heavy: scans the table's registration keyspace.
    fn invalidate_table(&self, tag: &str, table: &str) -> Result<Vec<String>>;

    fn flush_all(&self) -> Result<()>;

    /// Test-and-set the lock sentinel with expiry `ttl` iff the key holds no
    /// live value or lock. On success any stale signal channel is dropped in
    /// the same atomic step, so wake tokens from a prior timed-out holder
    /// cannot be consumed as fresh.
    fn acquire_lock(&self, key: &str, signal_key: &str, ttl: Duration) -> Result<bool>;

    /// Delete the sentinel iff the key still holds it, then unconditionally
    /// push one wake token and bound the channel's lifetime.
    fn release_lock(&self, key: &str, signal_key: &str) -> Result<()>;

    /// Block on the signal channel up to `timeout`. A `true` wake is
    /// advisory only; callers must re-attempt the read either way.
    fn wait_signal(&self, signal_key: &str, timeout: Duration) -> Result<bool>;

    /// Master node identifiers, in stable order.
    fn node_names(&self) -> Vec<String>;

    /// Changes whenever the node set changes; routers recompute tags on it.
    fn topology_epoch(&self) -> u64;

    /// The store's partitioning function: which node owns `key`. Honors
    /// `{...}` hash tags so co-located keys resolve to one node.
    fn node_for(&self, key: &str) -> String;
}

#[derive(Debug)]
enum Slot {
    Value {
        payload: Vec<u8>,
        expires_at: Option<Instant>,
    },
    Lock {
        expires_at: Instant,
    },
}

impl Slot {
    fn expired(&self, now: Instant) -> bool {
        match self {
            Slot::Value { expires_at, .. } => expires_at.is_some_and(|at| now >= at),
            Slot::Lock { expires_at } => now >= *expires_at,
        }
    }
}

#[derive(Debug)]
struct Registration {
    conj: Conjunction,
    members: HashSet<String>,
    /// `None` = never expires; bounded below by the longest-lived member.
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct NodeState {
    data: HashMap<String, Slot>,
    regs: HashMap<String, Registration>,
}

#[derive(Debug)]
struct Node {
    name: String,
    state: Mutex<NodeState>,
}

struct SignalSlot {
    tx: Sender<()>,
    rx: Receiver<()>,
    expires_at: Option<Instant>,
}

impl SignalSlot {
    fn fresh() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            expires_at: None,
        }
    }
}

/// In-memory sharded backend.
///
/// Each node owns a slice of the keyspace; every trait op locks exactly one
/// node's state mutex for its whole duration, giving the same atomicity a
/// per-shard server-side script would. Signal channels are keyed separately
/// but only ever mutated while the owning data key's node mutex is held.
pub struct MemoryCluster {
    nodes: RwLock<Vec<Node>>,
    signals: DashMap<String, SignalSlot>,
    epoch: AtomicU64,
}

impl MemoryCluster {
    pub fn new(node_count: usize) -> Self {
        let names = (0..node_count.max(1))
            .map(|i| format!("cache-{i}"))
            .collect::<Vec<_>>();
        Self::with_nodes(names)
    }

    pub fn with_nodes(names: Vec<String>) -> Self {
        let nodes = names
            .into_iter()
            .map(|name| Node {
                name,
                state: Mutex::new(NodeState::default()),
            })
            .collect();
        Self {
            nodes: RwLock::new(nodes),
            signals: DashMap::new(),
            epoch: AtomicU64::new(1),
        }
    }

    /// Grow the cluster; bumps the topology epoch so routers re-tag.
    pub fn add_node(&self, name: impl Into<String>) {
        self.nodes.write().push(Node {
            name: name.into(),
            state: Mutex::new(NodeState::default()),
        });
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn slot_index(&self, key: &str, node_count: usize) -> usize {
        // Hash-tag routing: `{tag}rest` partitions on `tag` alone.
        let routed = match (key.find('{'), key.find('}')) {
            (Some(open), Some(close)) if close > open + 1 => &key[open + 1..close],
            _ => key,
        };
        let mut hasher = FxHasher::default();
        hasher.write(routed.as_bytes());
        (hasher.finish() as usize) % node_count.max(1)
    }

    fn with_node<R>(&self, key: &str, f: impl FnOnce(&mut NodeState) -> R) -> R {
        let nodes = self.nodes.read();
        let idx = self.slot_index(key, nodes.len());
        let mut state = nodes[idx].state.lock();
        f(&mut state)
    }

    /// Drop an expired slot on read; returns the live slot if any.
    fn live_value(state: &mut NodeState, key: &str, now: Instant) -> Option<RemoteValue> {
        if state.data.get(key).is_some_and(|slot| slot.expired(now)) {
            state.data.remove(key);
            return None;
        }
        match state.data.get(key)? {
            Slot::Lock { .. } => Some(RemoteValue::Locked),
            Slot::Value {
                payload,
                expires_at,
            } => Some(RemoteValue::Value {
                payload: payload.clone(),
                ttl: expires_at.map(|at| at.saturating_duration_since(now)),
            }),
        }
    }
}

impl RemoteStore for MemoryCluster {
    fn get(&self, key: &str) -> Result<RemoteValue> {
        let now = Instant::now();
        Ok(self.with_node(key, |state| {
            Self::live_value(state, key, now).unwrap_or(RemoteValue::Missing)
        }))
    }

    fn set(&self, key: &str, payload: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.with_node(key, |state| {
            state.data.insert(
                key.to_string(),
                Slot::Value {
                    payload,
                    expires_at,
                },
            );
        });
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.with_node(key, |state| state.data.remove(key).is_some()))
    }

    fn register(
        &self,
        tag: &str,
        entry_key: &str,
        conjunctions: &[Conjunction],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.with_node(entry_key, |state| {
            for conj in conjunctions {
                let reg_key = registration_key(tag, conj);
                let reg = state.regs.entry(reg_key).or_insert_with(|| Registration {
                    conj: conj.clone(),
                    members: HashSet::new(),
                    expires_at,
                });
                reg.members.insert(entry_key.to_string());
                // Longest-lived member wins; None means no expiry at all.
                reg.expires_at = match (reg.expires_at, expires_at) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                };
            }
        });
        Ok(())
    }

    fn invalidate(
        &self,
        tag: &str,
        changed: &ChangedFields,
        max_scan: usize,
        deadline: Duration,
    ) -> Result<InvalidationOutcome> {
        let prefix = registration_prefix(tag, &changed.table);
        let started = Instant::now();
        let outcome = self.with_node(tag, |state| {
            let now = Instant::now();
            let mut outcome = InvalidationOutcome::default();
            let mut matched_regs = Vec::new();
            let mut doomed: HashSet<String> = HashSet::new();

            let reg_keys = state
                .regs
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect::<Vec<_>>();
            for reg_key in reg_keys {
                if outcome.scanned >= max_scan || started.elapsed() >= deadline {
                    outcome.truncated = true;
                    break;
                }
                outcome.scanned += 1;
                let Some(reg) = state.regs.get(&reg_key) else {
                    continue;
                };
                if reg.expires_at.is_some_and(|at| now >= at) {
                    state.regs.remove(&reg_key);
                    continue;
                }
                if reg.conj.matches(&changed.fields) {
                    outcome.matched += 1;
                    doomed.extend(reg.members.iter().cloned());
                    matched_regs.push(reg_key);
                }
            }
            for reg_key in matched_regs {
                state.regs.remove(&reg_key);
            }
            for key in &doomed {
                state.data.remove(key);
            }
            outcome.deleted_keys = doomed.into_iter().collect();
            outcome
        });
        Ok(outcome)
    }

    fn invalidate_table(&self, tag: &str, table: &str) -> Result<Vec<String>> {
        let prefix = registration_prefix(tag, table);
        let doomed = self.with_node(tag, |state| {
            let reg_keys = state
                .regs
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect::<Vec<_>>();
            let mut doomed: HashSet<String> = HashSet::new();
            for reg_key in reg_keys {
                if let Some(reg) = state.regs.remove(&reg_key) {
                    doomed.extend(reg.members);
                }
            }
            for key in &doomed {
                state.data.remove(key);
            }
            doomed.into_iter().collect::<Vec<_>>()
        });
        Ok(doomed)
    }

    fn flush_all(&self) -> Result<()> {
        let nodes = self.nodes.read();
        for node in nodes.iter() {
            let mut state = node.state.lock();
            state.data.clear();
            state.regs.clear();
        }
        self.signals.clear();
        Ok(())
    }

    fn acquire_lock(&self, key: &str, signal_key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        Ok(self.with_node(key, |state| {
            if Self::live_value(state, key, now).is_some() {
                return false;
            }
            state.data.insert(
                key.to_string(),
                Slot::Lock {
                    expires_at: now + ttl,
                },
            );
            // Same atomic step as the test-and-set: stale wake tokens from a
            // prior timed-out holder must not be consumed as fresh.
            self.signals.remove(signal_key);
            true
        }))
    }

    fn release_lock(&self, key: &str, signal_key: &str) -> Result<()> {
        self.with_node(key, |state| {
            if let Some(Slot::Lock { .. }) = state.data.get(key) {
                state.data.remove(key);
            }
            let mut slot = self
                .signals
                .entry(signal_key.to_string())
                .or_insert_with(SignalSlot::fresh);
            slot.expires_at = Some(Instant::now() + SIGNAL_TTL);
            let _ = slot.tx.send(());
        });
        Ok(())
    }

    fn wait_signal(&self, signal_key: &str, timeout: Duration) -> Result<bool> {
        let (rx, tx) = {
            let now = Instant::now();
            let mut slot = self
                .signals
                .entry(signal_key.to_string())
                .or_insert_with(SignalSlot::fresh);
            if slot.expires_at.is_some_and(|at| now >= at) {
                *slot = SignalSlot::fresh();
            }
            (slot.rx.clone(), slot.tx.clone())
        };
        match rx.recv_timeout(timeout) {
            Ok(()) => {
                // Rotate the token so one release wakes every waiter in turn.
                let _ = tx.send(());
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn node_names(&self) -> Vec<String> {
        self.nodes.read().iter().map(|n| n.name.clone()).collect()
    }

    fn topology_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn node_for(&self, key: &str) -> String {
        let nodes = self.nodes.read();
        let idx = self.slot_index(key, nodes.len());
        nodes[idx].name.clone()
    }
}
