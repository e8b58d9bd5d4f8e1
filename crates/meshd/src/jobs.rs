//! Housekeeping jobs run by the daemon through the cluster scheduler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use nodemesh::{CronJob, PeerCoordinator};
use nodemesh_core::NodeRegistry;
use nodemesh_proto::error::PeerResult;
use nodemesh_proto::node::now_millis;

/// Removes registry records of nodes that stopped heartbeating long ago.
pub struct PruneStaleNodes {
    registry: Arc<dyn NodeRegistry>,
    /// Records older than this are deleted.
    max_age: Duration,
}

impl PruneStaleNodes {
    pub fn new(registry: Arc<dyn NodeRegistry>, max_age: Duration) -> Self {
        Self { registry, max_age }
    }
}

#[async_trait]
impl CronJob for PruneStaleNodes {
    fn name(&self) -> &str {
        "prune-stale-nodes"
    }

    async fn run(&self) -> PeerResult<()> {
        let now = now_millis();
        let mut pruned = 0;
        for record in self.registry.load_all_nodes().await? {
            if !record.is_stale(now, self.max_age) {
                continue;
            }
            match self.registry.delete_node(&record.node_name).await {
                Ok(()) => {
                    info!("pruned stale node {}", record);
                    pruned += 1;
                }
                Err(e) => warn!("failed to prune {}: {}", record, e),
            }
        }
        if pruned > 0 {
            info!("pruned {} stale node record(s)", pruned);
        }
        Ok(())
    }
}

/// Logs which peers are connected, what each holds and this node's
/// coordination counters.
pub struct PeerCensus {
    peers: PeerCoordinator,
}

impl PeerCensus {
    pub fn new(peers: PeerCoordinator) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl CronJob for PeerCensus {
    fn name(&self) -> &str {
        "peer-census"
    }

    async fn run(&self) -> PeerResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.peers
            .apply_to_all_peers(move |node| {
                let _ = tx.send(format!(
                    "{}: {} client(s), {} lock(s)",
                    node.node_name,
                    node.clients.len(),
                    node.locks.len()
                ));
            })
            .await?;
        while let Ok(line) = rx.try_recv() {
            info!("census: {}", line);
        }
        let stats = self.peers.stats();
        info!(
            "census: {} lock(s) acquired, {} timed out, {} hijacked; {} message(s) in, {} out",
            stats.locks_acquired,
            stats.lock_timeouts,
            stats.locks_hijacked,
            stats.messages_in,
            stats.messages_out
        );
        Ok(())
    }
}
