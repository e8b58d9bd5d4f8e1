//! Published object table.
//!
//! Every object a node serves to its peers lives here under a local
//! [`Oid`], together with the peer connections subscribed to it and any
//! in-process watchers. Proxies of remote objects are stored the same way,
//! tagged with the peer and remote oid they mirror.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::mpsc;

use nodemesh_proto::error::{PeerError, PeerResult};
use nodemesh_proto::object::{ObjectEvent, Oid, SharedObject, NODE_STATE_OID};

use crate::inbound::ConnId;

/// Who hears about changes to one object.
#[derive(Default)]
pub(crate) struct Fanout {
    pub subscribers: BTreeSet<ConnId>,
    watchers: Vec<mpsc::UnboundedSender<ObjectEvent>>,
}

impl Fanout {
    pub fn watch(&mut self) -> mpsc::UnboundedReceiver<ObjectEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.push(tx);
        rx
    }

    /// Deliver `event` to local watchers, forgetting the ones that hung up.
    pub fn notify_watchers(&mut self, event: &ObjectEvent) {
        self.watchers.retain(|w| w.send(event.clone()).is_ok());
    }
}

pub(crate) struct Published {
    pub object: SharedObject,
    pub fanout: Fanout,
    /// `(peer, remote oid)` if this is a proxy of a peer's object.
    pub proxy_of: Option<(String, Oid)>,
}

pub(crate) struct ObjectTable {
    next_oid: u32,
    objects: HashMap<Oid, Published>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            next_oid: NODE_STATE_OID.0 + 1,
            objects: HashMap::new(),
        }
    }

    fn allocate(&mut self) -> Oid {
        loop {
            let oid = Oid(self.next_oid);
            self.next_oid = self.next_oid.wrapping_add(1);
            if oid.0 > NODE_STATE_OID.0 && !self.objects.contains_key(&oid) {
                return oid;
            }
        }
    }

    pub fn register(&mut self, object: SharedObject, proxy_of: Option<(String, Oid)>) -> Oid {
        let oid = self.allocate();
        self.objects.insert(
            oid,
            Published {
                object,
                fanout: Fanout::default(),
                proxy_of,
            },
        );
        oid
    }

    pub fn get(&self, oid: Oid) -> PeerResult<&Published> {
        self.objects.get(&oid).ok_or(PeerError::NoSuchObject(oid.0))
    }

    pub fn get_mut(&mut self, oid: Oid) -> PeerResult<&mut Published> {
        self.objects.get_mut(&oid).ok_or(PeerError::NoSuchObject(oid.0))
    }

    pub fn remove(&mut self, oid: Oid) -> Option<Published> {
        self.objects.remove(&oid)
    }

    /// Apply `event` to the object and its watchers. Returns the peer
    /// connections that must be sent the event.
    pub fn apply(&mut self, oid: Oid, event: &ObjectEvent) -> PeerResult<Vec<ConnId>> {
        let published = self.get_mut(oid)?;
        if !published.object.apply(event) {
            return Err(PeerError::InvalidParms);
        }
        published.fanout.notify_watchers(event);
        Ok(published.fanout.subscribers.iter().copied().collect())
    }

    /// Forget every subscription held by `conn`.
    pub fn drop_subscriber(&mut self, conn: ConnId) {
        for published in self.objects.values_mut() {
            published.fanout.subscribers.remove(&conn);
        }
    }
}
