//! Outbound peer sessions.
//!
//! A [`PeerSession`] owns this node's connection to one peer. It logs on
//! with the node's peer credentials, subscribes to the peer's `NodeState`
//! and keeps a replica of it. The connection itself is driven by a task
//! (`run_outbound`) that reports back to the coordinator; the session
//! struct only holds the bookkeeping and is mutated on the coordinator task.
//!
//! ```text
//! Disconnected --refresh--> Connecting --node state--> Connected
//!      ^                        |                          |
//!      +------- failure --------+-------- link lost -------+
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use nodemesh_core::transport::PeerTransport;
use nodemesh_proto::error::{PeerError, PeerResult};
use nodemesh_proto::message::{PeerMessage, PeerReply, PeerRequest};
use nodemesh_proto::node::{Credentials, NodeRecord, PeerCreds};
use nodemesh_proto::object::Oid;
use nodemesh_proto::state::NodeState;

use crate::coordinator::Command;
use crate::stats::StatCounters;

/// Connection state of a [`PeerSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    /// Connecting, logging on, or waiting for the peer's node state.
    Connecting,
    /// Subscribed to the peer's node state.
    Connected,
}

/// Reports from a session's connection task.
pub(crate) enum SessionEvent {
    /// Logged on; `out` feeds the link.
    Linked {
        out: mpsc::UnboundedSender<PeerMessage>,
        node_oid: Oid,
    },
    /// Could not connect or log on.
    Failed(PeerError),
    /// A message from the peer.
    Message(PeerMessage),
    /// The peer closed the link.
    Closed,
}

pub(crate) type ProxyReply = oneshot::Sender<PeerResult<Oid>>;

/// Where the answer to an invoked request goes.
pub(crate) type RequestReply = oneshot::Sender<PeerResult<PeerReply>>;

/// A request invoked on the peer and not answered yet.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub request: PeerRequest,
    /// `None` if the answer is only logged.
    pub reply: Option<RequestReply>,
}

/// Remote oid to local oid table for the objects proxied from one peer.
///
/// Every remote oid maps to a distinct, freshly allocated local oid, so the
/// table is injective; events are rewritten through it as they arrive.
#[derive(Default)]
pub(crate) struct OidMap {
    pending: HashMap<Oid, ProxyReply>,
    bound: HashMap<Oid, Oid>,
}

impl OidMap {
    /// Whether `remote` is proxied or about to be.
    pub fn contains(&self, remote: Oid) -> bool {
        self.pending.contains_key(&remote) || self.bound.contains_key(&remote)
    }

    pub fn pend(&mut self, remote: Oid, reply: ProxyReply) {
        self.pending.insert(remote, reply);
    }

    pub fn take_pending(&mut self, remote: Oid) -> Option<ProxyReply> {
        self.pending.remove(&remote)
    }

    pub fn bind(&mut self, remote: Oid, local: Oid) {
        self.bound.insert(remote, local);
    }

    pub fn unbind(&mut self, remote: Oid) -> Option<Oid> {
        self.bound.remove(&remote)
    }

    pub fn to_local(&self, remote: Oid) -> Option<Oid> {
        self.bound.get(&remote).copied()
    }

    /// Empty the table, returning the bound local oids and pending replies.
    pub fn drain(&mut self) -> (Vec<Oid>, Vec<ProxyReply>) {
        let locals = self.bound.drain().map(|(_, local)| local).collect();
        let pending = self.pending.drain().map(|(_, reply)| reply).collect();
        (locals, pending)
    }
}

/// What was torn down when a session closed.
pub(crate) struct ClosedSession {
    /// Last known state of the peer, if it had been received.
    pub state: Option<NodeState>,
    pub proxies: Vec<Oid>,
    pub pending_proxies: Vec<ProxyReply>,
}

/// This node's connection to one peer.
pub(crate) struct PeerSession {
    record: NodeRecord,
    status: SessionStatus,
    /// Bumped on every connect attempt and close; reports from an older
    /// connection task are ignored.
    generation: u64,
    /// When we last tried to connect (ms since the epoch).
    last_connect_stamp: u64,
    out: Option<mpsc::UnboundedSender<PeerMessage>>,
    remote_node_oid: Option<Oid>,
    state: Option<NodeState>,
    pub proxies: OidMap,
    next_request_id: u64,
    requests: HashMap<u64, PendingRequest>,
}

impl PeerSession {
    pub fn new(record: NodeRecord) -> Self {
        Self {
            record,
            status: SessionStatus::Disconnected,
            generation: 0,
            last_connect_stamp: 0,
            out: None,
            remote_node_oid: None,
            state: None,
            proxies: OidMap::default(),
            next_request_id: 1,
            requests: HashMap::new(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.record.node_name
    }

    pub fn record(&self) -> &NodeRecord {
        &self.record
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.status != SessionStatus::Disconnected
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    /// Whether `record` points somewhere else than the one we connected to.
    pub fn host_changed(&self, record: &NodeRecord) -> bool {
        record.host_name != self.record.host_name || record.port != self.record.port
    }

    /// Adopt a fresh registry record. Returns true if a connection attempt
    /// should be started; the caller spawns it with the new generation.
    pub fn refresh(&mut self, record: NodeRecord, stale_window: Duration, now_ms: u64) -> bool {
        self.record = record;

        if self.is_active() {
            return false;
        }

        // The peer has not checked in since our last attempt: don't hot-loop.
        let since_update = self.last_connect_stamp.saturating_sub(self.record.last_updated);
        if since_update > stale_window.as_millis() as u64 {
            debug!("peer: not reconnecting to stale {}", self.record);
            return false;
        }

        self.last_connect_stamp = now_ms;
        self.generation += 1;
        self.status = SessionStatus::Connecting;
        true
    }

    /// The connection task logged on.
    pub fn linked(&mut self, out: mpsc::UnboundedSender<PeerMessage>, node_oid: Oid) -> PeerResult<()> {
        self.out = Some(out);
        self.remote_node_oid = Some(node_oid);
        self.send(PeerMessage::Subscribe { oid: node_oid })
    }

    /// The connection attempt failed before it got anywhere.
    pub fn failed(&mut self) {
        self.status = SessionStatus::Disconnected;
        self.out = None;
        self.remote_node_oid = None;
    }

    pub fn is_node_oid(&self, oid: Oid) -> bool {
        self.remote_node_oid == Some(oid)
    }

    /// The peer's node state arrived: the session is now fully connected.
    pub fn node_available(&mut self, state: NodeState) {
        self.state = Some(state);
        self.status = SessionStatus::Connected;
    }

    pub fn state(&self) -> Option<&NodeState> {
        self.state.as_ref()
    }

    pub fn state_mut(&mut self) -> Option<&mut NodeState> {
        self.state.as_mut()
    }

    pub fn send(&self, msg: PeerMessage) -> PeerResult<()> {
        match &self.out {
            Some(out) => out
                .send(msg)
                .map_err(|_| PeerError::NotConnected(self.record.node_name.clone())),
            None => Err(PeerError::NotConnected(self.record.node_name.clone())),
        }
    }

    /// Invoke `request` on the peer. The reply comes back as an
    /// `InvokeResult` and is matched up with [`PeerSession::take_request`].
    /// If the session closes first, `reply` is dropped unanswered.
    pub fn invoke(&mut self, request: PeerRequest, reply: Option<RequestReply>) -> PeerResult<()> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.send(PeerMessage::Invoke {
            request_id,
            request: request.clone(),
        })?;
        self.requests.insert(request_id, PendingRequest { request, reply });
        Ok(())
    }

    pub fn take_request(&mut self, request_id: u64) -> Option<PendingRequest> {
        self.requests.remove(&request_id)
    }

    /// Tear the session down. Announces the logoff to the peer if the link
    /// is still up; dropping the sender then ends the connection task.
    pub fn close(&mut self) -> ClosedSession {
        if let Some(out) = self.out.take() {
            let _ = out.send(PeerMessage::Logoff);
        }
        if self.status == SessionStatus::Connected {
            info!("peer: logging off of {}", self.record);
        }
        self.status = SessionStatus::Disconnected;
        self.generation += 1;
        self.remote_node_oid = None;
        self.requests.clear();
        let (proxies, pending_proxies) = self.proxies.drain();
        ClosedSession {
            state: self.state.take(),
            proxies,
            pending_proxies,
        }
    }
}

/// Connection task of one session attempt.
///
/// Connects, logs on and then pumps messages both ways until either side
/// hangs up. Every outcome is reported to the coordinator tagged with
/// `generation`.
pub(crate) async fn run_outbound(
    transport: Arc<dyn PeerTransport>,
    record: NodeRecord,
    creds: PeerCreds,
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    stats: Arc<StatCounters>,
) {
    let peer = record.node_name.clone();
    let report = |event: SessionEvent| {
        commands
            .send(Command::Session {
                peer: peer.clone(),
                generation,
                event,
            })
            .is_ok()
    };

    let mut link = match transport.connect(&record.host_name, record.port).await {
        Ok(link) => link,
        Err(e) => {
            report(SessionEvent::Failed(e));
            return;
        }
    };

    let logon = PeerMessage::Logon {
        creds: Credentials::Peer(creds),
    };
    if link.tx.send(logon).await.is_err() {
        report(SessionEvent::Failed(PeerError::NetworkError));
        return;
    }

    let node_oid = match link.rx.recv().await {
        Some(PeerMessage::LogonAck { node_name, node_oid }) if node_name == peer => node_oid,
        Some(PeerMessage::LogonAck { node_name, .. }) => {
            report(SessionEvent::Failed(PeerError::Protocol(format!(
                "expected {}, reached {}",
                peer, node_name
            ))));
            return;
        }
        Some(PeerMessage::LogonFailed { error }) => {
            report(SessionEvent::Failed(error));
            return;
        }
        Some(other) => {
            report(SessionEvent::Failed(PeerError::Protocol(format!(
                "unexpected {:?} during logon",
                other.kind()
            ))));
            return;
        }
        None => {
            report(SessionEvent::Failed(PeerError::NetworkError));
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    if !report(SessionEvent::Linked {
        out: out_tx,
        node_oid,
    }) {
        return;
    }

    loop {
        tokio::select! {
            msg = link.rx.recv() => match msg {
                Some(msg) => {
                    stats.message_in();
                    if !report(SessionEvent::Message(msg)) {
                        return;
                    }
                }
                None => break,
            },
            out = out_rx.recv() => match out {
                Some(msg) => {
                    if link.tx.send(msg).await.is_err() {
                        break;
                    }
                    stats.message_out();
                }
                // Closed by the coordinator, which already knows.
                None => return,
            },
        }
    }

    report(SessionEvent::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(updated: u64) -> NodeRecord {
        let mut rec = NodeRecord::new("beta", "10.0.0.2", None, 4001);
        rec.last_updated = updated;
        rec
    }

    const WINDOW: Duration = Duration::from_secs(300);

    #[test]
    fn test_refresh_connects_once() {
        let mut session = PeerSession::new(record(1_000));
        assert!(session.refresh(record(1_000), WINDOW, 2_000));
        assert_eq!(session.status(), SessionStatus::Connecting);
        assert_eq!(session.generation(), 1);

        // Already active: nothing to do.
        assert!(!session.refresh(record(1_000), WINDOW, 3_000));
        assert_eq!(session.generation(), 1);
    }

    #[test]
    fn test_refresh_skips_stale_peer() {
        let mut session = PeerSession::new(record(1_000));
        assert!(session.refresh(record(1_000), WINDOW, 1_000_000));
        session.failed();

        // Record not updated since well before our last attempt.
        assert!(!session.refresh(record(1_000), WINDOW, 2_000_000));
        assert_eq!(session.status(), SessionStatus::Disconnected);

        // The peer checked in again.
        assert!(session.refresh(record(1_900_000), WINDOW, 2_000_000));
    }

    #[test]
    fn test_host_change_detected() {
        let session = PeerSession::new(record(0));
        assert!(!session.host_changed(&record(5)));
        let moved = NodeRecord::new("beta", "10.0.0.9", None, 4001);
        assert!(session.host_changed(&moved));
    }

    #[test]
    fn test_linked_subscribes_and_close_logs_off() {
        let mut session = PeerSession::new(record(0));
        session.refresh(record(0), WINDOW, 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.linked(tx, Oid(1)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), PeerMessage::Subscribe { oid: Oid(1) });
        assert!(session.is_node_oid(Oid(1)));

        session.node_available(NodeState::new("beta"));
        assert!(session.is_connected());
        let census = PeerRequest::Node {
            name: "census".into(),
            payload: vec![],
        };
        let (reply, mut answer) = oneshot::channel();
        session.invoke(census.clone(), None).unwrap();
        session.invoke(census.clone(), Some(reply)).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            PeerMessage::Invoke { request_id: 1, .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            PeerMessage::Invoke { request_id: 2, .. }
        ));
        let first = session.take_request(1).unwrap();
        assert_eq!(first.request, census);
        assert!(first.reply.is_none());
        assert!(session.take_request(1).is_none());

        // request 2 is still outstanding when the session goes away
        let closed = session.close();
        assert!(matches!(
            answer.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
        assert_eq!(closed.state, Some(NodeState::new("beta")));
        assert_eq!(rx.try_recv().unwrap(), PeerMessage::Logoff);
        assert_eq!(session.generation(), 2);
        assert!(!session.is_active());
        assert!(matches!(
            session.send(PeerMessage::Logoff),
            Err(PeerError::NotConnected(_))
        ));
    }

    #[test]
    fn test_oid_map() {
        let mut map = OidMap::default();
        let (tx, _rx) = oneshot::channel();
        map.pend(Oid(7), tx);
        assert!(map.contains(Oid(7)));
        assert!(map.take_pending(Oid(7)).is_some());
        map.bind(Oid(7), Oid(42));
        assert!(map.contains(Oid(7)));
        assert_eq!(map.to_local(Oid(7)), Some(Oid(42)));
        assert_eq!(map.to_local(Oid(8)), None);

        let (locals, pending) = map.drain();
        assert_eq!(locals, vec![Oid(42)]);
        assert!(pending.is_empty());
        assert!(!map.contains(Oid(7)));
    }
}
