//! nodemesh peer coordination daemon (meshd).
//!
//! Runs one node of a nodemesh cluster: registers it in the shared node
//! registry, connects to every peer found there, takes part in lock
//! negotiations and runs the cluster-wide housekeeping jobs.
//!
//! Usage:
//!   meshd [OPTIONS] --name <NAME> --registry <DIR>
//!
//! The shared secret is read from `NODEMESH_SECRET` unless given with
//! `--secret`.

mod jobs;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use nodemesh::{CoordinatorConfig, PeerCoordinator, ScheduledJobCoordinator};
use nodemesh_core::{FileRegistry, NodeRegistry, TcpTransport};
use nodemesh_proto::defaults::{
    DEFAULT_BIND_ADDR, DEFAULT_DISCOVERY_INTERVAL_SECS, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_PEER_PORT,
    DEFAULT_STALE_MULTIPLE,
};
use nodemesh_proto::lock::Lock;

use crate::jobs::{PeerCensus, PruneStaleNodes};

/// nodemesh peer coordination daemon
#[derive(Parser, Debug)]
#[command(name = "meshd", version, about = "nodemesh peer coordination daemon")]
struct Args {
    /// Unique name of this node in the cluster
    #[arg(short = 'n', long = "name", env = "NODEMESH_NODE")]
    node_name: String,

    /// Secret shared by every node of the cluster
    #[arg(long, env = "NODEMESH_SECRET", hide_env_values = true)]
    secret: String,

    /// Host peers use to reach this node
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Host ordinary clients use to reach this node (defaults to --host)
    #[arg(long)]
    public_host: Option<String>,

    /// Peer listen port
    #[arg(short = 'p', long, default_value_t = DEFAULT_PEER_PORT)]
    port: u16,

    /// Listen address
    #[arg(short = 'b', long, default_value = DEFAULT_BIND_ADDR)]
    bind_addr: String,

    /// Directory holding the shared node registry
    #[arg(short = 'r', long = "registry", value_name = "DIR")]
    registry_dir: PathBuf,

    /// Lock negotiation timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_LOCK_TIMEOUT_MS)]
    lock_timeout_ms: u64,

    /// Seconds between discovery cycles
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_INTERVAL_SECS)]
    discovery_interval: u64,

    /// Discovery cycles without a heartbeat before a peer is considered stale
    #[arg(long, default_value_t = DEFAULT_STALE_MULTIPLE)]
    stale_multiple: u32,

    /// Hours between prunes of dead node records (0 to disable)
    #[arg(long, default_value_t = 6)]
    prune_every: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn coordinator_config(&self) -> CoordinatorConfig {
        let mut config =
            CoordinatorConfig::new(&self.node_name, &self.secret, &self.host, self.port);
        config.public_host = self.public_host.clone();
        config.bind_addr = self.bind_addr.clone();
        config.lock_timeout = Duration::from_millis(self.lock_timeout_ms);
        config.discovery_interval = Duration::from_secs(self.discovery_interval);
        config.stale_multiple = self.stale_multiple;
        config
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("meshd v{} starting as {}", env!("CARGO_PKG_VERSION"), args.node_name);

    if args.secret.is_empty() {
        error!("refusing to start without a shared secret");
        std::process::exit(1);
    }

    let registry: Arc<dyn NodeRegistry> = match FileRegistry::open(&args.registry_dir).await {
        Ok(registry) => {
            info!("node registry at {}", registry.dir().display());
            Arc::new(registry)
        }
        Err(e) => {
            error!("failed to open registry {}: {}", args.registry_dir.display(), e);
            std::process::exit(1);
        }
    };

    let config = args.coordinator_config();
    let stale_window = config.stale_window();
    let peers = match PeerCoordinator::start(
        config.clone(),
        Arc::new(TcpTransport::new()),
        registry.clone(),
    )
    .await
    {
        Ok(peers) => peers,
        Err(e) => {
            error!("failed to start peer coordinator: {}", e);
            std::process::exit(1);
        }
    };

    let dropped = peers.add_dropped_lock_observer(Arc::new(|lock: &Lock| {
        warn!("lost lock {} to a peer", lock);
    }));
    if let Err(e) = dropped {
        warn!("failed to watch for dropped locks: {}", e);
    }

    // Cluster-wide housekeeping
    let cron = ScheduledJobCoordinator::new(peers.clone(), &config);
    if args.prune_every > 0 {
        let prune = PruneStaleNodes::new(registry.clone(), stale_window * 2);
        if let Err(e) = cron.schedule_every(args.prune_every, Arc::new(prune)) {
            warn!("invalid prune interval {}: {}", args.prune_every, e);
        }
    }
    if let Err(e) = cron.schedule_every(1, Arc::new(PeerCensus::new(peers.clone()))) {
        warn!("failed to schedule census: {}", e);
    }
    cron.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to wait for SIGINT: {}", e);
    }
    info!("SIGINT received, shutting down");

    // ---------------------------------------------------------------
    // Graceful shutdown
    // ---------------------------------------------------------------
    cron.stop();
    if let Err(e) = peers.shutdown().await {
        warn!("peer coordinator shutdown failed: {}", e);
    }

    info!("meshd stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_map_onto_config() {
        let args = Args::parse_from([
            "meshd",
            "--name",
            "alpha",
            "--secret",
            "s3cret",
            "--registry",
            "/tmp/nodes",
            "--public-host",
            "alpha.example.org",
            "--lock-timeout-ms",
            "2500",
        ]);
        let config = args.coordinator_config();
        assert_eq!(config.node_name, "alpha");
        assert_eq!(config.port, DEFAULT_PEER_PORT);
        assert_eq!(config.lock_timeout, Duration::from_millis(2500));
        assert_eq!(config.node_record().public_host_name, "alpha.example.org");
        assert_eq!(args.prune_every, 6);
    }
}
