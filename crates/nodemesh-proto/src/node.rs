/// Node identity, registry record, and peer credential types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::hash::peer_password;

/// Milliseconds since the Unix epoch, as stored in `NodeRecord::last_updated`.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Persisted description of one node in the cluster.
///
/// Upserted by the node itself on every heartbeat and read by every peer
/// during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique, cluster-wide node name
    pub node_name: String,
    /// Host other peers use to reach this node
    pub host_name: String,
    /// Host ordinary clients use to reach this node
    pub public_host_name: String,
    /// Peer port
    pub port: u16,
    /// Last heartbeat, in milliseconds since the Unix epoch
    pub last_updated: u64,
}

impl NodeRecord {
    pub fn new(
        node_name: impl Into<String>,
        host_name: impl Into<String>,
        public_host_name: Option<String>,
        port: u16,
    ) -> Self {
        let host_name = host_name.into();
        Self {
            node_name: node_name.into(),
            public_host_name: public_host_name.unwrap_or_else(|| host_name.clone()),
            host_name,
            port,
            last_updated: now_millis(),
        }
    }

    /// True if no heartbeat has landed within `window` of `now_ms`.
    pub fn is_stale(&self, now_ms: u64, window: Duration) -> bool {
        now_ms.saturating_sub(self.last_updated) > window.as_millis() as u64
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.node_name, self.host_name, self.port)
    }
}

/// Credentials a node presents when logging on to one of its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCreds {
    pub node_name: String,
    pub password: String,
}

impl PeerCreds {
    /// Build the credentials for `node_name` under the cluster's shared secret.
    pub fn new(node_name: &str, shared_secret: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            password: peer_password(node_name, shared_secret),
        }
    }
}

/// Any credentials arriving at the server, peer or otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Credentials {
    /// Another node of the cluster.
    Peer(PeerCreds),
    /// An ordinary end user; handled by the host server's own authenticator.
    User { username: String, password: String },
}

impl Credentials {
    /// The name the credentials claim.
    pub fn name(&self) -> &str {
        match self {
            Credentials::Peer(creds) => &creds.node_name,
            Credentials::User { username, .. } => username,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_name() {
        let peer = Credentials::Peer(PeerCreds::new("alpha", "s"));
        assert_eq!(peer.name(), "alpha");
        let user = Credentials::User {
            username: "bob".into(),
            password: "pw".into(),
        };
        assert_eq!(user.name(), "bob");
    }

    #[test]
    fn test_public_host_defaults_to_host() {
        let rec = NodeRecord::new("a", "10.0.0.1", None, 4000);
        assert_eq!(rec.public_host_name, "10.0.0.1");

        let rec = NodeRecord::new("a", "10.0.0.1", Some("a.example.com".into()), 4000);
        assert_eq!(rec.public_host_name, "a.example.com");
    }

    #[test]
    fn test_staleness() {
        let mut rec = NodeRecord::new("a", "h", None, 1);
        rec.last_updated = 10_000;
        let window = Duration::from_secs(5);
        assert!(!rec.is_stale(15_000, window));
        assert!(rec.is_stale(15_001, window));
        // Clock skew into the past never counts as stale.
        assert!(!rec.is_stale(0, window));
    }

    #[test]
    fn test_creds_match_password_hash() {
        let creds = PeerCreds::new("node-a", "secret");
        assert_eq!(creds.password, peer_password("node-a", "secret"));
    }
}
