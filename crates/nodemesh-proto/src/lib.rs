//! # nodemesh-proto
//!
//! Protocol types, constants, and data structures for nodemesh, the peer
//! coordination layer of a small cluster of cooperating server nodes.
//!
//! This crate defines the wire messages, the replicated node state, lock
//! identifiers, registry records, error types, and hashing shared by all
//! nodemesh components.

pub mod defaults;
pub mod error;
pub mod hash;
pub mod lock;
pub mod message;
pub mod node;
pub mod object;
pub mod state;

// Re-export commonly used types at the crate root
pub use error::{PeerError, PeerResult};
pub use lock::{Lock, LockIntent};
pub use message::{PeerMessage, PeerReply, PeerRequest};
pub use node::{Credentials, NodeRecord, PeerCreds};
pub use object::{AttrObject, ObjectEvent, Oid, SharedObject, NODE_STATE_OID};
pub use state::{CacheInvalidation, ClientInfo, NodeEvent, NodeState};
