/// Replicated objects and their change events.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::state::{NodeEvent, NodeState};

/// Identifier of an object in one node's object space.
///
/// The same object generally has a different `Oid` on every node that
/// knows about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Oid(pub u32);

/// Oid under which every node publishes its own [`NodeState`].
pub const NODE_STATE_OID: Oid = Oid(1);

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{}", self.0)
    }
}

/// A generic object made of named opaque attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrObject {
    pub attrs: BTreeMap<String, Vec<u8>>,
}

impl AttrObject {
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.attrs.get(name).map(|v| v.as_slice())
    }
}

/// Anything a node can publish for peers to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedObject {
    Node(NodeState),
    Attrs(AttrObject),
}

/// A change to a [`SharedObject`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectEvent {
    Node(NodeEvent),
    AttributeChanged { name: String, value: Vec<u8> },
}

impl SharedObject {
    /// Apply an event. Returns false if the event does not fit this kind of
    /// object, in which case nothing changes.
    pub fn apply(&mut self, event: &ObjectEvent) -> bool {
        match (self, event) {
            (SharedObject::Node(state), ObjectEvent::Node(ev)) => {
                state.apply(ev);
                true
            }
            (SharedObject::Attrs(obj), ObjectEvent::AttributeChanged { name, value }) => {
                obj.attrs.insert(name.clone(), value.clone());
                true
            }
            _ => false,
        }
    }
}
