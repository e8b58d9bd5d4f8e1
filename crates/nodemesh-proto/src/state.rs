/// The per-node shared state and the events that replicate it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::lock::Lock;

/// A locally connected end user, published to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub username: String,
    /// Per-deployment extras (location, session flags, ...)
    pub fields: BTreeMap<String, String>,
}

impl ClientInfo {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// A stale-cache broadcast payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInvalidation {
    /// Name of the cache observers registered under
    pub cache: String,
    /// Opaque description of the stale data
    pub payload: Vec<u8>,
}

/// State each node publishes to its peers.
///
/// Only the owning node mutates it, always through [`NodeEvent`]s so that
/// subscribers see every change in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_name: String,
    /// Locally connected clients, keyed by username
    pub clients: BTreeMap<String, ClientInfo>,
    /// Locks held by this node
    pub locks: BTreeSet<Lock>,
    /// Signal: the lock this node is trying to acquire
    pub acquiring_lock: Option<Lock>,
    /// Signal: the lock this node is trying to release
    pub releasing_lock: Option<Lock>,
    /// Signal: the most recent stale-cache broadcast
    pub cache_data: Option<CacheInvalidation>,
}

/// A single change to a [`NodeState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    ClientAdded(ClientInfo),
    ClientUpdated(ClientInfo),
    ClientRemoved(String),
    LockAdded(Lock),
    LockRemoved(Lock),
    /// Rewrite of a held lock; announces that a pending release was aborted.
    LockUpdated(Lock),
    AcquiringLock(Option<Lock>),
    ReleasingLock(Option<Lock>),
    CacheData(Option<CacheInvalidation>),
}

impl NodeState {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Default::default()
        }
    }

    pub fn holds(&self, lock: &Lock) -> bool {
        self.locks.contains(lock)
    }

    pub fn client(&self, username: &str) -> Option<&ClientInfo> {
        self.clients.get(username)
    }

    /// Apply a replicated change.
    pub fn apply(&mut self, event: &NodeEvent) {
        match event {
            NodeEvent::ClientAdded(info) | NodeEvent::ClientUpdated(info) => {
                self.clients.insert(info.username.clone(), info.clone());
            }
            NodeEvent::ClientRemoved(username) => {
                self.clients.remove(username);
            }
            NodeEvent::LockAdded(lock) | NodeEvent::LockUpdated(lock) => {
                self.locks.insert(lock.clone());
            }
            NodeEvent::LockRemoved(lock) => {
                self.locks.remove(lock);
            }
            NodeEvent::AcquiringLock(lock) => self.acquiring_lock = lock.clone(),
            NodeEvent::ReleasingLock(lock) => self.releasing_lock = lock.clone(),
            NodeEvent::CacheData(data) => self.cache_data = data.clone(),
        }
    }
}
