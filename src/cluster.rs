//! # Shard Router
//!
//! Computes one short co-location tag per master node so that every key a
//! single invalidation script touches for one table hashes to one shard.
//! Tags are probed through the store's own partitioning function: `{0}`,
//! `{1}`, ... until every node has a covering tag. The mapping is cached and
//! rebuilt lazily when the observed topology epoch changes, never on every
//! call.

use crate::remote::RemoteStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Probing gives up after this many candidates per node. Exceeding it means
/// the candidate space cannot cover the node set.
const TAG_PROBE_FACTOR: usize = 16;

/// The router cannot cover every node with available tags. Fatal to the
/// router only: callers must fail startup or disable cluster mode rather
/// than silently misroute.
#[derive(Debug)]
pub struct TopologyError {
    pub message: String,
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard topology error: {}", self.message)
    }
}

impl std::error::Error for TopologyError {}

#[derive(Debug)]
struct RouterState {
    epoch: u64,
    tag_by_node: HashMap<String, String>,
    /// Tags in node order, for whole-cluster sweeps.
    tags: Vec<String>,
}

/// Maps tables and logical keys onto shard-stable storage keys.
pub struct ShardRouter {
    store: Arc<dyn RemoteStore>,
    state: RwLock<RouterState>,
}

impl ShardRouter {
    /// Build the router, computing the initial tag mapping eagerly so a
    /// topology the tags cannot cover fails at startup.
    pub fn new(store: Arc<dyn RemoteStore>) -> Result<Self, TopologyError> {
        let state = Self::compute(store.as_ref())?;
        Ok(Self {
            store,
            state: RwLock::new(state),
        })
    }

    fn compute(store: &dyn RemoteStore) -> Result<RouterState, TopologyError> {
        let epoch = store.topology_epoch();
        let nodes = store.node_names();
        let limit = TAG_PROBE_FACTOR * nodes.len().max(1);
        let mut tag_by_node: HashMap<String, String> = HashMap::new();

        let mut candidate = 0usize;
        while tag_by_node.len() < nodes.len() {
            if candidate >= limit {
                return Err(TopologyError {
                    message: format!(
                        "cannot cover {} nodes with {limit} candidate tags",
                        nodes.len()
                    ),
                });
            }
            let tag = format!("{{{candidate}}}");
            let node = store.node_for(&tag);
            tag_by_node.entry(node).or_insert(tag);
            candidate += 1;
        }

        let tags = nodes
            .iter()
            .map(|node| tag_by_node[node].clone())
            .collect();
        Ok(RouterState {
            epoch,
            tag_by_node,
            tags,
        })
    }

    /// Recompute the mapping iff the topology identity changed.
    fn ensure_current(&self) -> Result<(), TopologyError> {
        let epoch = self.store.topology_epoch();
        if self.state.read().epoch == epoch {
            return Ok(());
        }
        let state = Self::compute(self.store.as_ref())?;
        *self.state.write() = state;
        Ok(())
    }

    /// One tag per master node, for operations that must sweep every shard.
    pub fn all_tags(&self) -> Result<Vec<String>, TopologyError> {
        self.ensure_current()?;
        Ok(self.state.read().tags.clone())
    }

    /// The tag of the shard owning `table`'s keyspace.
    pub fn tag_for_table(&self, table: &str) -> Result<String, TopologyError> {
        self.ensure_current()?;
        let node = self.store.node_for(table);
        self.state
            .read()
            .tag_by_node
            .get(&node)
            .cloned()
            .ok_or_else(|| TopologyError {
                message: format!("no tag for node {node}"),
            })
    }

    /// Wrap a logical key so it co-locates with `table`'s registrations.
    pub fn key_for(&self, table: &str, logical_key: &str) -> Result<String, TopologyError> {
        Ok(format!("{}{logical_key}", self.tag_for_table(table)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryCluster;

    #[test]
    fn tags_cover_every_node() {
        let store = Arc::new(MemoryCluster::new(4));
        let router = ShardRouter::new(store.clone()).unwrap();
        let tags = router.all_tags().unwrap();
        assert_eq!(tags.len(), 4);
        let covered: std::collections::HashSet<String> =
            tags.iter().map(|t| store.node_for(t)).collect();
        assert_eq!(covered.len(), 4);
    }

    #[test]
    fn tag_assignment_is_stable_across_calls() {
        let store = Arc::new(MemoryCluster::new(3));
        let router = ShardRouter::new(store).unwrap();
        let first = router.tag_for_table("users").unwrap();
        let second = router.tag_for_table("users").unwrap();
        assert_eq!(first, second);
        assert_eq!(router.all_tags().unwrap(), router.all_tags().unwrap());
    }

    #[test]
    fn keys_colocate_with_their_table() {
        let store = Arc::new(MemoryCluster::new(4));
        let router = ShardRouter::new(store.clone()).unwrap();
        let key = router.key_for("users", "q:abc").unwrap();
        assert_eq!(store.node_for(&key), store.node_for("users"));
    }

    #[test]
    fn topology_change_triggers_retag() {
        let store = Arc::new(MemoryCluster::new(2));
        let router = ShardRouter::new(store.clone()).unwrap();
        assert_eq!(router.all_tags().unwrap().len(), 2);
        store.add_node("cache-extra");
        assert_eq!(router.all_tags().unwrap().len(), 3);
    }

    #[test]
    fn uncoverable_topology_fails_loudly() {
        use crate::model::{ChangedFields, Conjunction};
        use crate::remote::{InvalidationOutcome, RemoteValue};
        use std::time::Duration;

        // A store whose partitioning function routes everything to one node
        // even though two are advertised: no tag set can cover it.
        struct LopsidedStore;

        impl RemoteStore for LopsidedStore {
            fn get(&self, _: &str) -> anyhow::Result<RemoteValue> {
                Ok(RemoteValue::Missing)
            }
            fn set(&self, _: &str, _: Vec<u8>, _: Option<Duration>) -> anyhow::Result<()> {
                Ok(())
            }
            fn delete(&self, _: &str) -> anyhow::Result<bool> {
                Ok(false)
            }
            fn register(
                &self,
                _: &str,
                _: &str,
                _: &[Conjunction],
                _: Option<Duration>,
            ) -> anyhow::Result<()> {
                Ok(())
            }
            fn invalidate(
                &self,
                _: &str,
                _: &ChangedFields,
                _: usize,
                _: Duration,
            ) -> anyhow::Result<InvalidationOutcome> {
                Ok(InvalidationOutcome::default())
            }
            fn invalidate_table(&self, _: &str, _: &str) -> anyhow::Result<Vec<String>> {
                Ok(Vec::new())
            }
            fn flush_all(&self) -> anyhow::Result<()> {
                Ok(())
            }
            fn acquire_lock(&self, _: &str, _: &str, _: Duration) -> anyhow::Result<bool> {
                Ok(false)
            }
            fn release_lock(&self, _: &str, _: &str) -> anyhow::Result<()> {
                Ok(())
            }
            fn wait_signal(&self, _: &str, _: Duration) -> anyhow::Result<bool> {
                Ok(false)
            }
            fn node_names(&self) -> Vec<String> {
                vec!["a".to_string(), "b".to_string()]
            }
            fn topology_epoch(&self) -> u64 {
                1
            }
            fn node_for(&self, _: &str) -> String {
                "a".to_string()
            }
        }

        let Err(err) = ShardRouter::new(Arc::new(LopsidedStore)) else {
            panic!("lopsided topology must not yield a router");
        };
        assert!(err.message.contains("cannot cover"));
    }
}
