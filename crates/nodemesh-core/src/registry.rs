//! Node registry: where nodes publish their existence and discover peers.
//!
//! Every node upserts its own [`NodeRecord`] on each heartbeat and loads
//! everyone's records on each discovery cycle. All calls are async so the
//! coordinator can run them off its own task.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use nodemesh_proto::error::PeerResult;
use nodemesh_proto::node::{now_millis, NodeRecord};

/// Persistent store of node records keyed by node name.
#[async_trait]
pub trait NodeRegistry: Send + Sync + 'static {
    /// Human-readable name for logging ("memory", "file").
    fn name(&self) -> &str;

    /// Insert or replace the record for `record.node_name`.
    async fn upsert_node(&self, record: &NodeRecord) -> PeerResult<()>;

    /// Bump `last_updated` of an existing record to now.
    ///
    /// Returns `false` if there is no record for `node_name`.
    async fn heartbeat(&self, node_name: &str) -> PeerResult<bool>;

    /// Every record currently registered, in node name order.
    async fn load_all_nodes(&self) -> PeerResult<Vec<NodeRecord>>;

    /// Remove the record for `node_name`, if any.
    async fn delete_node(&self, node_name: &str) -> PeerResult<()>;
}

/// In-memory registry. Clones share the same table, so one instance can
/// serve every node of a simulated cluster.
#[derive(Clone, Debug, Default)]
pub struct MemoryRegistry {
    nodes: Arc<RwLock<BTreeMap<String, NodeRecord>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRegistry for MemoryRegistry {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert_node(&self, record: &NodeRecord) -> PeerResult<()> {
        let mut nodes = self.nodes.write().await;
        nodes.insert(record.node_name.clone(), record.clone());
        Ok(())
    }

    async fn heartbeat(&self, node_name: &str) -> PeerResult<bool> {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(node_name) {
            Some(rec) => {
                rec.last_updated = now_millis();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn load_all_nodes(&self) -> PeerResult<Vec<NodeRecord>> {
        let nodes = self.nodes.read().await;
        Ok(nodes.values().cloned().collect())
    }

    async fn delete_node(&self, node_name: &str) -> PeerResult<()> {
        self.nodes.write().await.remove(node_name);
        Ok(())
    }
}
