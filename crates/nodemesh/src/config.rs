//! Coordinator configuration.
//!
//! Identity and timings of one node. Everything defaults to the values in
//! `nodemesh_proto::defaults`; the daemon overrides them from the command
//! line, tests shrink the timings.

use std::time::Duration;

use nodemesh_proto::defaults::{
    DEFAULT_BIND_ADDR, DEFAULT_CRON_JITTER_MS, DEFAULT_CRON_TICK_MS,
    DEFAULT_DISCOVERY_INTERVAL_SECS, DEFAULT_HEARTBEAT_JITTER_MS, DEFAULT_LOCK_TIMEOUT_MS,
    DEFAULT_LOGON_TIMEOUT_MS, DEFAULT_PEER_PORT, DEFAULT_REFRESH_DELAY_MS,
    DEFAULT_STALE_MULTIPLE,
};
use nodemesh_proto::node::{NodeRecord, PeerCreds};

/// Identity and tunables of one coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Unique, cluster-wide name of this node.
    pub node_name: String,
    /// Secret shared by every node of the cluster.
    pub shared_secret: String,
    /// Host peers use to reach this node.
    pub host: String,
    /// Host ordinary clients use to reach this node (defaults to `host`).
    pub public_host: Option<String>,
    /// Peer port.
    pub port: u16,
    /// Address the peer listener binds to.
    pub bind_addr: String,

    /// How long an own negotiation waits for ratification.
    pub lock_timeout: Duration,
    /// Delay before the first discovery cycle.
    pub refresh_delay: Duration,
    /// Period of the heartbeat + discovery cycle.
    pub discovery_interval: Duration,
    /// Maximum jitter (+/-) applied to each discovery period.
    pub heartbeat_jitter: Duration,
    /// A record is stale after this many discovery periods without a heartbeat.
    pub stale_multiple: u32,
    /// How long an accepted link may take to log on.
    pub logon_timeout: Duration,

    /// Nominal cron tick period.
    pub cron_tick: Duration,
    /// Maximum amount subtracted from each cron tick.
    pub cron_jitter: Duration,
}

impl CoordinatorConfig {
    /// Configuration with default tunables.
    pub fn new(
        node_name: impl Into<String>,
        shared_secret: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            shared_secret: shared_secret.into(),
            host: host.into(),
            public_host: None,
            port,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            refresh_delay: Duration::from_millis(DEFAULT_REFRESH_DELAY_MS),
            discovery_interval: Duration::from_secs(DEFAULT_DISCOVERY_INTERVAL_SECS),
            heartbeat_jitter: Duration::from_millis(DEFAULT_HEARTBEAT_JITTER_MS),
            stale_multiple: DEFAULT_STALE_MULTIPLE,
            logon_timeout: Duration::from_millis(DEFAULT_LOGON_TIMEOUT_MS),
            cron_tick: Duration::from_millis(DEFAULT_CRON_TICK_MS),
            cron_jitter: Duration::from_millis(DEFAULT_CRON_JITTER_MS),
        }
    }

    /// Window after which a silent node record is considered stale.
    pub fn stale_window(&self) -> Duration {
        self.discovery_interval * self.stale_multiple
    }

    /// Tracking negotiations (owned by a peer) give the owner twice our own
    /// timeout before giving up on it.
    pub fn tracking_timeout(&self) -> Duration {
        self.lock_timeout * 2
    }

    /// The record this node publishes in the registry.
    pub fn node_record(&self) -> NodeRecord {
        NodeRecord::new(
            self.node_name.clone(),
            self.host.clone(),
            self.public_host.clone(),
            self.port,
        )
    }

    /// Credentials this node presents to its peers.
    pub fn peer_creds(&self) -> PeerCreds {
        PeerCreds::new(&self.node_name, &self.shared_secret)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::new("localhost", "", "localhost", DEFAULT_PEER_PORT)
    }
}
