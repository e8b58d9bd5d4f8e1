//! Peer wire messages.
//!
//! Every link between two nodes carries a stream of [`PeerMessage`]s. The
//! connecting side logs on, subscribes to objects and invokes requests; the
//! accepting side answers and streams object events to its subscribers.

use serde::{Deserialize, Serialize};

use crate::error::PeerError;
use crate::lock::{Lock, LockIntent};
use crate::node::Credentials;
use crate::object::{ObjectEvent, Oid, SharedObject};

/// Message types exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// First message on every link: a peer logging on, or an end user.
    Logon { creds: Credentials },
    /// Logon accepted; carries the oid of the accepting node's state.
    LogonAck { node_name: String, node_oid: Oid },
    /// Logon refused. The link is closed right after.
    LogonFailed { error: PeerError },
    /// Subscribe to an object in the remote object space.
    Subscribe { oid: Oid },
    /// Drop a subscription.
    Unsubscribe { oid: Oid },
    /// Subscription granted, with the current object state.
    ObjectAvailable { oid: Oid, object: SharedObject },
    /// Subscription refused.
    SubscribeFailed { oid: Oid, error: PeerError },
    /// A change to a subscribed object.
    Event { oid: Oid, event: ObjectEvent },
    /// Remote method invocation.
    Invoke { request_id: u64, request: PeerRequest },
    /// Result of an earlier `Invoke`.
    InvokeResult {
        request_id: u64,
        result: Result<PeerReply, PeerError>,
    },
    /// Graceful logoff announcement.
    Logoff,
}

/// Discriminant of a [`PeerMessage`], used to key handler tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Logon,
    LogonAck,
    LogonFailed,
    Subscribe,
    Unsubscribe,
    ObjectAvailable,
    SubscribeFailed,
    Event,
    Invoke,
    InvokeResult,
    Logoff,
}

impl PeerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            PeerMessage::Logon { .. } => MessageKind::Logon,
            PeerMessage::LogonAck { .. } => MessageKind::LogonAck,
            PeerMessage::LogonFailed { .. } => MessageKind::LogonFailed,
            PeerMessage::Subscribe { .. } => MessageKind::Subscribe,
            PeerMessage::Unsubscribe { .. } => MessageKind::Unsubscribe,
            PeerMessage::ObjectAvailable { .. } => MessageKind::ObjectAvailable,
            PeerMessage::SubscribeFailed { .. } => MessageKind::SubscribeFailed,
            PeerMessage::Event { .. } => MessageKind::Event,
            PeerMessage::Invoke { .. } => MessageKind::Invoke,
            PeerMessage::InvokeResult { .. } => MessageKind::InvokeResult,
            PeerMessage::Logoff => MessageKind::Logoff,
        }
    }
}

/// Requests a node can invoke on a peer it is logged on to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Acknowledge the peer's announced acquire or release of `lock`.
    RatifyLock { lock: Lock, intent: LockIntent },
    /// Run the handler registered under `name` with an opaque payload.
    Node { name: String, payload: Vec<u8> },
}

/// Successful replies to a [`PeerRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerReply {
    Ratified,
    /// What a node request handler returned.
    Node(Vec<u8>),
}
