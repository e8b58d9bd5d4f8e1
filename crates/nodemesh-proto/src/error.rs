/// nodemesh error types.
///
/// Peer coordination failures, wire protocol errors, and registry errors are
/// represented as a single enum so that results can cross task boundaries and
/// the wire unchanged.

use serde::{Deserialize, Serialize};

/// Unified error type for all nodemesh operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum PeerError {
    #[error("network error")]
    NetworkError,
    #[error("peer is not online")]
    PeerOffline,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(usize),
    #[error("failed to encode or decode message")]
    Codec,
    #[error("peer authentication rejected")]
    AuthRejected,
    #[error("no connection to peer {0}")]
    NotConnected(String),
    #[error("object {oid} on {peer} is already proxied")]
    AlreadyProxied { peer: String, oid: u32 },
    #[error("object {oid} on {peer} is not proxied")]
    NotProxied { peer: String, oid: u32 },
    #[error("no such object {0}")]
    NoSuchObject(u32),
    #[error("lock is held by {0}")]
    LockHeldElsewhere(String),
    #[error("lock could not be acquired")]
    LockUnavailable,
    #[error("node registry failure: {0}")]
    Persistence(String),
    #[error("coordinator has shut down")]
    Shutdown,
    #[error("no node request handler named {0}")]
    NoSuchHandler(String),
    #[error("job failed: {0}")]
    JobFailed(String),
    #[error("invalid parameters")]
    InvalidParms,
}

impl PeerError {
    /// Connection refusals are expected while a peer is down and are logged
    /// at a lower severity than other connectivity failures.
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::PeerOffline)
    }
}

/// Result type alias for nodemesh operations.
pub type PeerResult<T> = Result<T, PeerError>;

impl From<std::io::Error> for PeerError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionRefused => PeerError::PeerOffline,
            _ => PeerError::NetworkError,
        }
    }
}

impl From<bincode::Error> for PeerError {
    fn from(_: bincode::Error) -> Self {
        PeerError::Codec
    }
}
