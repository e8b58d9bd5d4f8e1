//! Peer transport abstraction. Decouples the peer protocol from the network.
//!
//! Two implementations:
//! - [`TcpTransport`](crate::tcp_transport::TcpTransport): kernel TCP with
//!   length-prefixed bincode frames
//! - [`LocalTransport`](crate::local_transport::LocalTransport): in-process
//!   channels, for simulating several nodes inside one process
//!
//! A transport only moves [`PeerMessage`]s. Logon, subscriptions, and lock
//! traffic are handled above it, so every transport speaks the same protocol.

use async_trait::async_trait;
use nodemesh_proto::error::PeerResult;
use nodemesh_proto::message::PeerMessage;
use tokio::sync::mpsc;

/// One bidirectional message link to a remote node.
///
/// Dropping `tx` closes the outbound direction; `rx` yields `None` once the
/// remote side has gone away.
pub struct Link {
    /// Human-readable description of the remote end.
    pub remote: String,
    pub tx: mpsc::Sender<PeerMessage>,
    pub rx: mpsc::Receiver<PeerMessage>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("remote", &self.remote).finish()
    }
}

/// Abstraction over the node-to-node transport.
///
/// The coordinator selects TCP or the in-process transport at startup.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Human-readable name for logging ("tcp" or "local").
    fn name(&self) -> &str;

    /// Open a link to the node listening on `host:port`.
    async fn connect(&self, host: &str, port: u16) -> PeerResult<Link>;

    /// Start accepting links on `bind_host:port`.
    async fn start_listener(&self, bind_host: &str, port: u16) -> PeerResult<Box<dyn PeerListener>>;

    /// Shut down the transport, stopping listeners and background tasks.
    async fn shutdown(&self) -> PeerResult<()>;
}

/// Listener for inbound peer links.
#[async_trait]
pub trait PeerListener: Send + Sync {
    /// Accept the next inbound link. Blocks (async) until one arrives.
    async fn accept(&self) -> PeerResult<Link>;
}
