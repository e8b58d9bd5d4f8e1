//! # nodemesh-core
//!
//! Core shared library for nodemesh.
//! Provides the pluggable peer transports (TCP and in-process) and the node
//! registry used for peer discovery.

pub mod file_registry;
pub mod local_transport;
pub mod registry;
pub mod tcp_transport;
pub mod transport;

pub use file_registry::FileRegistry;
pub use local_transport::{LocalNetwork, LocalTransport};
pub use registry::{MemoryRegistry, NodeRegistry};
pub use tcp_transport::TcpTransport;
pub use transport::{Link, PeerListener, PeerTransport};
