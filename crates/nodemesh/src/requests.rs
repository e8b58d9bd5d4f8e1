//! Node actions and node requests.
//!
//! A handler is registered by name on every node that should answer it. A
//! caller picks the target nodes with a filter over their `NodeState`,
//! this node included. Actions are fire-and-forget; requests collect one
//! answer per target.
//!
//! Handlers run on the coordinator task and must not block.

use tokio::sync::oneshot;
use tracing::{debug, warn};

use nodemesh_proto::error::{PeerError, PeerResult};
use nodemesh_proto::message::{PeerReply, PeerRequest};
use nodemesh_proto::state::NodeState;

use crate::coordinator::State;
use crate::inbound::ConnId;

/// Answers node requests registered under one name.
pub trait NodeRequestHandler: Send + Sync {
    fn handle(&self, payload: &[u8]) -> PeerResult<Vec<u8>>;
}

impl<F> NodeRequestHandler for F
where
    F: Fn(&[u8]) -> PeerResult<Vec<u8>> + Send + Sync,
{
    fn handle(&self, payload: &[u8]) -> PeerResult<Vec<u8>> {
        self(payload)
    }
}

/// Picks the nodes an action or request goes to.
pub(crate) type NodeFilter = Box<dyn Fn(&NodeState) -> bool + Send>;

/// One target's eventual answer to a node request.
pub(crate) type NodeAnswer = oneshot::Receiver<PeerResult<PeerReply>>;

impl State {
    /// This node and every connected peer that `filter` accepts, in that
    /// order.
    fn applicable_nodes(&self, filter: &NodeFilter) -> Vec<String> {
        std::iter::once(&self.node)
            .chain(self.sessions.values().filter_map(|s| s.state()))
            .filter(|node| filter(*node))
            .map(|node| node.node_name.clone())
            .collect()
    }

    fn run_node_handler(&self, name: &str, payload: &[u8]) -> PeerResult<Vec<u8>> {
        match self.node_handlers.get(name) {
            Some(handler) => handler.handle(payload),
            None => Err(PeerError::NoSuchHandler(name.to_string())),
        }
    }

    pub(crate) fn on_node_request(&self, conn: ConnId, name: &str, payload: &[u8]) -> PeerResult<PeerReply> {
        debug!("peer: running {} for {}", name, conn);
        self.run_node_handler(name, payload).map(PeerReply::Node)
    }

    /// Run handler `name` on every applicable node. Returns the nodes it
    /// was run on or sent to.
    pub(crate) fn invoke_node_action(&mut self, name: String, payload: Vec<u8>, filter: NodeFilter) -> Vec<String> {
        let mut invoked = Vec::new();
        for node in self.applicable_nodes(&filter) {
            if node == self.node_name() {
                if let Err(e) = self.run_node_handler(&name, &payload) {
                    warn!("peer: node action {} failed: {}", name, e);
                }
                invoked.push(node);
                continue;
            }
            let request = PeerRequest::Node {
                name: name.clone(),
                payload: payload.clone(),
            };
            let sent = match self.sessions.get_mut(&node) {
                Some(session) => session.invoke(request, None),
                None => Err(PeerError::NotConnected(node.clone())),
            };
            match sent {
                Ok(()) => invoked.push(node),
                Err(e) => warn!("peer: could not send node action {} to {}: {}", name, node, e),
            }
        }

        if invoked.is_empty() {
            debug!("peer: node action {} matched no node", name);
        } else {
            self.stats.node_action_invoked();
        }
        invoked
    }

    /// Send request `name` to every applicable node. Returns one pending
    /// answer per node; a peer that goes away first drops its answer.
    pub(crate) fn invoke_node_request(
        &mut self,
        name: String,
        payload: Vec<u8>,
        filter: NodeFilter,
    ) -> Vec<(String, NodeAnswer)> {
        let mut answers = Vec::new();
        for node in self.applicable_nodes(&filter) {
            let (reply, answer) = oneshot::channel();
            if node == self.node_name() {
                let _ = reply.send(self.run_node_handler(&name, &payload).map(PeerReply::Node));
            } else if let Some(session) = self.sessions.get_mut(&node) {
                let request = PeerRequest::Node {
                    name: name.clone(),
                    payload: payload.clone(),
                };
                if let Err(e) = session.invoke(request, Some(reply)) {
                    debug!("peer: could not send node request {} to {}: {}", name, node, e);
                }
            }
            answers.push((node, answer));
        }
        answers
    }
}
