//! Inbound peer connections.
//!
//! Peers connect to this node to subscribe to its `NodeState` (and to any
//! other published object) and to ratify its lock negotiations. The accept
//! loop authenticates each link's logon and then hands its messages to the
//! coordinator, which routes them through a [`DispatchTable`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use nodemesh_core::transport::{Link, PeerListener};
use nodemesh_proto::error::PeerError;
use nodemesh_proto::message::{MessageKind, PeerMessage};
use nodemesh_proto::object::{Oid, SharedObject};
use nodemesh_proto::state::ClientInfo;

use crate::auth::{PeerAuthenticator, Principal};
use crate::coordinator::{Command, State};
use crate::stats::StatCounters;

/// Identifies one inbound peer connection on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// A logged-on inbound connection, as seen by the coordinator.
pub(crate) struct InboundConn {
    pub node_name: String,
    out: mpsc::UnboundedSender<PeerMessage>,
}

impl InboundConn {
    pub fn new(node_name: String, out: mpsc::UnboundedSender<PeerMessage>) -> Self {
        Self { node_name, out }
    }

    pub fn send(&self, msg: PeerMessage) {
        if self.out.send(msg).is_err() {
            debug!("peer: link to {} already closed", self.node_name);
        }
    }
}

/// Everything the accept loop needs to log peers on.
pub(crate) struct AcceptContext {
    pub auth: PeerAuthenticator,
    pub node_name: String,
    pub node_oid: Oid,
    pub logon_timeout: Duration,
    pub commands: mpsc::UnboundedSender<Command>,
    pub stats: Arc<StatCounters>,
}

/// Accept peer links until shut down.
pub(crate) fn spawn_acceptor(
    listener: Box<dyn PeerListener>,
    ctx: AcceptContext,
    shutdown: Arc<Notify>,
) {
    let ctx = Arc::new(ctx);
    tokio::spawn(async move {
        let mut next_conn = 0u64;
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    debug!("peer: acceptor shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(link) => {
                        next_conn += 1;
                        tokio::spawn(serve_inbound(link, ConnId(next_conn), ctx.clone()));
                    }
                    Err(PeerError::Shutdown) => break,
                    Err(e) => warn!("peer: accept failed: {}", e),
                },
            }
            if ctx.commands.is_closed() {
                break;
            }
        }
    });
}

/// Log one inbound link on and pump its messages until either side hangs up.
async fn serve_inbound(mut link: Link, conn: ConnId, ctx: Arc<AcceptContext>) {
    let first = match tokio::time::timeout(ctx.logon_timeout, link.rx.recv()).await {
        Ok(Some(msg)) => msg,
        Ok(None) => return,
        Err(_) => {
            warn!("peer: {} never logged on", link.remote);
            return;
        }
    };

    let creds = match first {
        PeerMessage::Logon { creds } => creds,
        other => {
            warn!("peer: {} sent {:?} before logging on", link.remote, other.kind());
            return;
        }
    };

    let principal = match ctx.auth.authenticate(&creds) {
        Ok(principal) => principal,
        Err(e) => {
            warn!(
                "peer: rejecting logon of {} from {}: {}",
                creds.name(),
                link.remote,
                e
            );
            let _ = link.tx.send(PeerMessage::LogonFailed { error: e }).await;
            return;
        }
    };

    let ack = PeerMessage::LogonAck {
        node_name: ctx.node_name.clone(),
        node_oid: ctx.node_oid,
    };
    if link.tx.send(ack).await.is_err() {
        return;
    }

    match principal {
        Principal::Peer(node_name) => serve_peer(link, conn, node_name, &ctx).await,
        Principal::User(username) => serve_user(link, username, &ctx).await,
    }
}

async fn serve_peer(mut link: Link, conn: ConnId, node_name: String, ctx: &AcceptContext) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let opened = Command::InboundOpened {
        conn,
        node_name,
        out: out_tx,
    };
    if ctx.commands.send(opened).is_err() {
        return;
    }

    loop {
        tokio::select! {
            msg = link.rx.recv() => match msg {
                Some(msg) => {
                    ctx.stats.message_in();
                    if ctx.commands.send(Command::Inbound { conn, msg }).is_err() {
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
                    ctx.stats.message_out();
                }
                None => break,
            },
        }
    }

    let _ = ctx.commands.send(Command::InboundClosed { conn });
}

/// An end user vouched for by the host server's authenticator. It is listed
/// in this node's client directory for as long as its link stays up.
async fn serve_user(mut link: Link, username: String, ctx: &AcceptContext) {
    info!("peer: user {} logged on from {}", username, link.remote);
    if ctx
        .commands
        .send(Command::ClientStarted(ClientInfo::new(username.clone())))
        .is_err()
    {
        return;
    }

    while let Some(msg) = link.rx.recv().await {
        match msg {
            PeerMessage::Logoff => break,
            other => debug!("peer: ignoring {:?} from user {}", other.kind(), username),
        }
    }

    debug!("peer: user {} logged off", username);
    let _ = ctx.commands.send(Command::ClientEnded(username));
}

/// Handler for one kind of inbound message.
pub(crate) type InboundHandler = fn(&mut State, ConnId, PeerMessage);

/// Routes inbound messages to their handlers by message kind.
pub(crate) struct DispatchTable {
    handlers: HashMap<MessageKind, InboundHandler>,
}

impl DispatchTable {
    pub fn new() -> Self {
        let mut handlers: HashMap<MessageKind, InboundHandler> = HashMap::new();
        handlers.insert(MessageKind::Subscribe, State::on_subscribe);
        handlers.insert(MessageKind::Unsubscribe, State::on_unsubscribe);
        handlers.insert(MessageKind::Invoke, State::on_invoke);
        handlers.insert(MessageKind::Logoff, State::on_logoff);
        Self { handlers }
    }

    pub fn dispatch(&self, state: &mut State, conn: ConnId, msg: PeerMessage) {
        let kind = msg.kind();
        match self.handlers.get(&kind) {
            Some(handler) => handler(state, conn, msg),
            None => warn!("peer: unexpected {:?} on {}", kind, conn),
        }
    }
}

impl State {
    pub(crate) fn inbound_opened(
        &mut self,
        conn: ConnId,
        node_name: String,
        out: mpsc::UnboundedSender<PeerMessage>,
    ) {
        info!("peer: {} logged on ({})", node_name, conn);
        // possibly the first we hear of it: look it up and connect back
        let linked = self.sessions.get(&node_name).map_or(false, |s| s.is_active());
        self.conns.insert(conn, InboundConn::new(node_name, out));
        if !linked {
            self.refresh_peers();
        }
    }

    /// The connection is gone: its subscriptions lapse, which counts as
    /// ratification of anything it was still expected to ratify.
    pub(crate) fn inbound_closed(&mut self, conn: ConnId) {
        if let Some(gone) = self.conns.remove(&conn) {
            debug!("peer: {} disconnected ({})", gone.node_name, conn);
            self.objects.drop_subscriber(conn);
            self.subscriber_gone(conn);
        }
    }

    fn reply(&self, conn: ConnId, msg: PeerMessage) {
        if let Some(c) = self.conns.get(&conn) {
            c.send(msg);
        }
    }

    pub(crate) fn on_subscribe(&mut self, conn: ConnId, msg: PeerMessage) {
        let PeerMessage::Subscribe { oid } = msg else {
            return;
        };
        if oid == self.node_oid {
            self.node_fanout.subscribers.insert(conn);
            let object = SharedObject::Node(self.node.clone());
            self.reply(conn, PeerMessage::ObjectAvailable { oid, object });
            return;
        }
        let reply = match self.objects.get_mut(oid) {
            Ok(published) => {
                published.fanout.subscribers.insert(conn);
                PeerMessage::ObjectAvailable {
                    oid,
                    object: published.object.clone(),
                }
            }
            Err(error) => PeerMessage::SubscribeFailed { oid, error },
        };
        self.reply(conn, reply);
    }

    pub(crate) fn on_unsubscribe(&mut self, conn: ConnId, msg: PeerMessage) {
        let PeerMessage::Unsubscribe { oid } = msg else {
            return;
        };
        if oid == self.node_oid {
            self.subscriber_gone(conn);
        } else if let Ok(published) = self.objects.get_mut(oid) {
            published.fanout.subscribers.remove(&conn);
        }
    }

    pub(crate) fn on_invoke(&mut self, conn: ConnId, msg: PeerMessage) {
        let PeerMessage::Invoke {
            request_id,
            request,
        } = msg
        else {
            return;
        };
        let result = self.handle_request(conn, request);
        self.reply(conn, PeerMessage::InvokeResult { request_id, result });
    }

    pub(crate) fn on_logoff(&mut self, conn: ConnId, _msg: PeerMessage) {
        if let Some(c) = self.conns.get(&conn) {
            info!("peer: {} logged off", c.node_name);
        }
        self.inbound_closed(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodemesh_core::local_transport::{LocalNetwork, LocalTransport};
    use nodemesh_core::transport::PeerTransport;
    use nodemesh_proto::error::PeerResult;
    use nodemesh_proto::node::{Credentials, PeerCreds};

    use crate::auth::Authenticator;

    struct OnlyBob;

    impl Authenticator for OnlyBob {
        fn authenticate(&self, username: &str, password: &str) -> PeerResult<()> {
            if username == "bob" && password == "hunter2" {
                Ok(())
            } else {
                Err(PeerError::AuthRejected)
            }
        }
    }

    async fn acceptor(network: &LocalNetwork, auth: PeerAuthenticator) -> mpsc::UnboundedReceiver<Command> {
        let transport = LocalTransport::new(network);
        let listener = transport.start_listener("alpha", 1).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = AcceptContext {
            auth,
            node_name: "alpha".into(),
            node_oid: Oid(1),
            logon_timeout: Duration::from_secs(5),
            commands: tx,
            stats: Arc::new(StatCounters::default()),
        };
        spawn_acceptor(listener, ctx, Arc::new(Notify::new()));
        rx
    }

    async fn log_on(network: &LocalNetwork, creds: Credentials) -> Link {
        let client = LocalTransport::new(network);
        let link = client.connect("alpha", 1).await.unwrap();
        link.tx.send(PeerMessage::Logon { creds }).await.unwrap();
        link
    }

    fn user(username: &str, password: &str) -> Credentials {
        Credentials::User {
            username: username.into(),
            password: password.into(),
        }
    }

    #[tokio::test]
    async fn test_good_logon_is_acked_and_forwarded() {
        let network = LocalNetwork::new();
        let mut commands = acceptor(&network, PeerAuthenticator::new("s3cret")).await;

        let creds = Credentials::Peer(PeerCreds::new("beta", "s3cret"));
        let mut link = log_on(&network, creds).await;
        assert_eq!(
            link.rx.recv().await,
            Some(PeerMessage::LogonAck {
                node_name: "alpha".into(),
                node_oid: Oid(1)
            })
        );

        match commands.recv().await {
            Some(Command::InboundOpened { node_name, .. }) => assert_eq!(node_name, "beta"),
            _ => panic!("expected InboundOpened"),
        }

        link.tx.send(PeerMessage::Subscribe { oid: Oid(1) }).await.unwrap();
        match commands.recv().await {
            Some(Command::Inbound { msg, .. }) => {
                assert_eq!(msg, PeerMessage::Subscribe { oid: Oid(1) })
            }
            _ => panic!("expected Inbound"),
        }

        drop(link);
        assert!(matches!(
            commands.recv().await,
            Some(Command::InboundClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_bad_password_is_rejected() {
        let network = LocalNetwork::new();
        let mut commands = acceptor(&network, PeerAuthenticator::new("s3cret")).await;

        let creds = Credentials::Peer(PeerCreds::new("beta", "guess"));
        let mut link = log_on(&network, creds).await;
        assert_eq!(
            link.rx.recv().await,
            Some(PeerMessage::LogonFailed {
                error: PeerError::AuthRejected
            })
        );
        assert_eq!(link.rx.recv().await, None);
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_user_logon_goes_through_delegate() {
        let network = LocalNetwork::new();
        let auth = PeerAuthenticator::new("s3cret").with_delegate(Arc::new(OnlyBob));
        let mut commands = acceptor(&network, auth).await;

        let mut link = log_on(&network, user("bob", "hunter2")).await;
        assert!(matches!(
            link.rx.recv().await,
            Some(PeerMessage::LogonAck { .. })
        ));
        match commands.recv().await {
            Some(Command::ClientStarted(info)) => assert_eq!(info.username, "bob"),
            _ => panic!("expected ClientStarted"),
        }

        // users don't get to talk the peer protocol
        link.tx.send(PeerMessage::Subscribe { oid: Oid(1) }).await.unwrap();
        link.tx.send(PeerMessage::Logoff).await.unwrap();
        match commands.recv().await {
            Some(Command::ClientEnded(username)) => assert_eq!(username, "bob"),
            _ => panic!("expected ClientEnded"),
        }

        let mut eve = log_on(&network, user("eve", "hunter2")).await;
        assert_eq!(
            eve.rx.recv().await,
            Some(PeerMessage::LogonFailed {
                error: PeerError::AuthRejected
            })
        );
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_user_logon_without_delegate_is_rejected() {
        let network = LocalNetwork::new();
        let mut commands = acceptor(&network, PeerAuthenticator::new("s3cret")).await;

        let mut link = log_on(&network, user("bob", "hunter2")).await;
        assert_eq!(
            link.rx.recv().await,
            Some(PeerMessage::LogonFailed {
                error: PeerError::AuthRejected
            })
        );
        assert!(commands.try_recv().is_err());
    }
}
