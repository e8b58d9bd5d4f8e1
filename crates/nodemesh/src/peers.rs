//! Peer membership and outbound sessions.
//!
//! Every discovery cycle reloads the node registry and reconciles the
//! session table against it. Connection tasks report back through
//! `Command::Session`; reports from a superseded connection attempt carry
//! an old generation and are dropped.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use nodemesh_proto::error::{PeerError, PeerResult};
use nodemesh_proto::message::PeerMessage;
use nodemesh_proto::node::{now_millis, NodeRecord};
use nodemesh_proto::object::{ObjectEvent, Oid, SharedObject};
use nodemesh_proto::state::NodeEvent;

use crate::coordinator::State;
use crate::session::{run_outbound, PeerSession, PendingRequest, ProxyReply, SessionEvent};

impl State {
    pub(crate) fn nodes_loaded(&mut self, result: PeerResult<Vec<NodeRecord>>) {
        self.refreshing = false;
        let records = match result {
            Ok(records) => records,
            Err(e) => {
                warn!("peer: failed to load node records: {}", e);
                return;
            }
        };

        let now = now_millis();
        let window = self.config.stale_window();
        let mut known = HashSet::new();
        for record in records {
            if record.node_name == self.node_name() {
                continue;
            }
            // a stale record counts as gone
            if record.is_stale(now, window) {
                debug!("peer: skipping stale {}", record);
                continue;
            }
            known.insert(record.node_name.clone());
            self.refresh_peer(record);
        }

        let gone: Vec<String> = self
            .sessions
            .keys()
            .filter(|name| !known.contains(*name))
            .cloned()
            .collect();
        for name in gone {
            info!("peer: {} left the registry or went stale", name);
            self.disconnect_peer(&name);
            self.sessions.remove(&name);
        }
    }

    fn refresh_peer(&mut self, record: NodeRecord) {
        let name = record.node_name.clone();
        let moved = self
            .sessions
            .get(&name)
            .map_or(false, |s| s.is_active() && s.host_changed(&record));
        if moved {
            info!("peer: {} moved to {}:{}", name, record.host_name, record.port);
            self.disconnect_peer(&name);
        }

        let window = self.config.stale_window();
        let session = self
            .sessions
            .entry(name)
            .or_insert_with(|| PeerSession::new(record.clone()));
        if session.refresh(record, window, now_millis()) {
            debug!("peer: connecting to {}", session.record());
            tokio::spawn(run_outbound(
                self.transport.clone(),
                session.record().clone(),
                self.config.peer_creds(),
                session.generation(),
                self.commands.clone(),
                self.stats.clone(),
            ));
        }
    }

    /// Close the session to `name`, dropping its proxies and settling
    /// whatever it held or was negotiating.
    pub(crate) fn disconnect_peer(&mut self, name: &str) {
        let Some(session) = self.sessions.get_mut(name) else {
            return;
        };
        let closed = session.close();
        for local in closed.proxies {
            self.objects.remove(local);
        }
        for reply in closed.pending_proxies {
            let _ = reply.send(Err(PeerError::NotConnected(name.to_string())));
        }
        if let Some(state) = closed.state {
            self.peer_did_logoff(name, state.locks.into_iter().collect());
        }
    }

    pub(crate) fn session_event(&mut self, peer: String, generation: u64, event: SessionEvent) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            debug!("peer: event for unknown session {}", peer);
            return;
        };
        if session.generation() != generation {
            debug!("peer: dropping report of stale connection to {}", peer);
            return;
        }

        match event {
            SessionEvent::Linked { out, node_oid } => {
                if let Err(e) = session.linked(out, node_oid) {
                    warn!("peer: failed to subscribe to {}: {}", peer, e);
                    self.disconnect_peer(&peer);
                }
            }
            SessionEvent::Failed(e) => {
                session.failed();
                if e.is_offline() {
                    info!("peer: {} not online", session.record());
                } else {
                    warn!("peer: failed to connect to {}: {}", session.record(), e);
                }
            }
            SessionEvent::Closed => {
                info!("peer: lost connection to {}", peer);
                self.disconnect_peer(&peer);
            }
            SessionEvent::Message(msg) => self.session_message(&peer, msg),
        }
    }

    fn session_message(&mut self, peer: &str, msg: PeerMessage) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };

        match msg {
            PeerMessage::ObjectAvailable { oid, object } if session.is_node_oid(oid) => match object {
                SharedObject::Node(state) => {
                    session.node_available(state);
                    info!("peer: connected to {}", session.record());
                    self.peer_did_logon(peer);
                }
                SharedObject::Attrs(_) => {
                    warn!("peer: {} published something else as its node state", peer);
                    self.disconnect_peer(peer);
                }
            },
            PeerMessage::ObjectAvailable { oid, object } => match session.proxies.take_pending(oid) {
                Some(reply) => {
                    let local = self.objects.register(object, Some((peer.to_string(), oid)));
                    session.proxies.bind(oid, local);
                    debug!("peer: proxying {} on {} as {}", oid, peer, local);
                    let _ = reply.send(Ok(local));
                }
                None => warn!("peer: {} delivered unrequested {}", peer, oid),
            },
            PeerMessage::SubscribeFailed { oid, error } => {
                if let Some(reply) = session.proxies.take_pending(oid) {
                    let _ = reply.send(Err(error));
                } else if session.is_node_oid(oid) {
                    warn!("peer: {} refused its node state: {}", peer, error);
                    self.disconnect_peer(peer);
                } else {
                    debug!("peer: {} refused {}: {}", peer, oid, error);
                }
            }
            PeerMessage::Event { oid, event } if session.is_node_oid(oid) => match event {
                ObjectEvent::Node(event) => self.peer_node_event(peer, event),
                ObjectEvent::AttributeChanged { name, .. } => {
                    warn!("peer: {} sent attribute {} for its node state", peer, name)
                }
            },
            PeerMessage::Event { oid, event } => match session.proxies.to_local(oid) {
                Some(local) => {
                    if let Err(e) = self.post_object_event(local, event) {
                        warn!("peer: dropping event for {} from {}: {}", local, peer, e);
                    }
                }
                None => debug!("peer: ignoring event for unproxied {} from {}", oid, peer),
            },
            PeerMessage::InvokeResult { request_id, result } => match session.take_request(request_id) {
                Some(PendingRequest {
                    reply: Some(reply), ..
                }) => {
                    let _ = reply.send(result);
                }
                Some(PendingRequest { request, reply: None }) => match result {
                    Err(e) => warn!("peer: {} failed {:?}: {}", peer, request, e),
                    Ok(reply) => debug!("peer: {} answered {:?} with {:?}", peer, request, reply),
                },
                None => warn!("peer: {} answered unknown request {}", peer, request_id),
            },
            PeerMessage::Logoff => {
                info!("peer: {} logged off", peer);
                self.disconnect_peer(peer);
            }
            other => warn!("peer: unexpected {:?} from {}", other.kind(), peer),
        }
    }

    /// Apply a change of a peer's node state to our replica, then react to it.
    fn peer_node_event(&mut self, peer: &str, event: NodeEvent) {
        match self.sessions.get_mut(peer).and_then(|s| s.state_mut()) {
            Some(state) => state.apply(&event),
            None => {
                warn!("peer: {} changed its state before publishing it", peer);
                return;
            }
        }

        match event {
            NodeEvent::LockAdded(lock) => self.peer_added_lock(peer, lock),
            NodeEvent::LockRemoved(lock) => self.peer_removed_lock(peer, lock),
            NodeEvent::LockUpdated(lock) => self.peer_updated_lock(peer, lock),
            NodeEvent::AcquiringLock(Some(lock)) => self.peer_acquiring_lock(peer, lock),
            NodeEvent::ReleasingLock(Some(lock)) => self.peer_releasing_lock(peer, lock),
            NodeEvent::CacheData(Some(data)) => self.changed_cache_data(&data),
            _ => {}
        }
    }

    // ─── Proxies ───

    pub(crate) fn proxy_remote_object(&mut self, peer: String, remote: Oid, reply: ProxyReply) {
        let session = match self.sessions.get_mut(&peer) {
            Some(session) if session.is_connected() => session,
            _ => {
                let _ = reply.send(Err(PeerError::NotConnected(peer)));
                return;
            }
        };
        if session.is_node_oid(remote) {
            let _ = reply.send(Err(PeerError::InvalidParms));
            return;
        }
        if session.proxies.contains(remote) {
            let _ = reply.send(Err(PeerError::AlreadyProxied {
                peer,
                oid: remote.0,
            }));
            return;
        }
        match session.send(PeerMessage::Subscribe { oid: remote }) {
            Ok(()) => session.proxies.pend(remote, reply),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    pub(crate) fn unproxy_remote_object(&mut self, peer: &str, remote: Oid) -> PeerResult<()> {
        let session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| PeerError::NotConnected(peer.to_string()))?;
        let local = session.proxies.unbind(remote).ok_or_else(|| PeerError::NotProxied {
            peer: peer.to_string(),
            oid: remote.0,
        })?;
        if let Err(e) = session.send(PeerMessage::Unsubscribe { oid: remote }) {
            debug!("peer: could not unsubscribe {} on {}: {}", remote, peer, e);
        }
        self.objects.remove(local);
        Ok(())
    }
}
