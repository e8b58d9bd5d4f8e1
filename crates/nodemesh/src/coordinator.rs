//! The peer coordinator.
//!
//! All coordination state (this node's `NodeState`, the peer sessions, the
//! inbound connections, published objects and lock negotiations) is owned
//! by a single task. [`PeerCoordinator`] is a cheap, cloneable handle that
//! talks to that task over a command channel; every public operation is a
//! command with a oneshot reply.
//!
//! Network I/O, registry access and timers all run on their own tasks and
//! post their results back as commands, so the coordinator task never
//! blocks on anything but its own channel.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time;
use tracing::{debug, error, info, warn};

use nodemesh_core::registry::NodeRegistry;
use nodemesh_core::transport::PeerTransport;
use nodemesh_proto::error::{PeerError, PeerResult};
use nodemesh_proto::lock::Lock;
use nodemesh_proto::message::{PeerMessage, PeerReply};
use nodemesh_proto::node::NodeRecord;
use nodemesh_proto::object::{AttrObject, ObjectEvent, Oid, SharedObject, NODE_STATE_OID};
use nodemesh_proto::state::{CacheInvalidation, ClientInfo, NodeEvent, NodeState};

use crate::auth::{Authenticator, PeerAuthenticator};
use crate::config::CoordinatorConfig;
use crate::inbound::{self, AcceptContext, ConnId, DispatchTable, InboundConn};
use crate::negotiation::{LockNegotiation, LockReply};
use crate::objects::{Fanout, ObjectTable};
use crate::observer::{same_observer, DroppedLockObserver, StaleCacheObserver};
use crate::requests::{NodeAnswer, NodeFilter, NodeRequestHandler};
use crate::session::{PeerSession, ProxyReply, SessionEvent, SessionStatus};
use crate::stats::{PeerStats, StatCounters};

/// Callback run on the coordinator task over this node's state followed by
/// every connected peer's state.
pub(crate) type NodeVisitor = Box<dyn FnOnce(&mut dyn Iterator<Item = &NodeState>) + Send>;

/// Watch handle returned by [`PeerCoordinator::watch_object`].
pub type ObjectWatch = (SharedObject, mpsc::UnboundedReceiver<ObjectEvent>);

/// Messages processed by the coordinator task.
pub(crate) enum Command {
    // ─── Locking ───
    Acquire { lock: Lock, reply: LockReply },
    Release { lock: Lock, reply: LockReply },
    Reacquire { lock: Lock, reply: LockReply },
    QueryLock { lock: Lock, reply: oneshot::Sender<Option<String>> },
    NegotiationTimeout { lock: Lock, serial: u64 },
    AddDroppedLockObserver(Arc<dyn DroppedLockObserver>),
    RemoveDroppedLockObserver(Arc<dyn DroppedLockObserver>),

    // ─── Cache invalidation ───
    AddCacheObserver { cache: String, observer: Arc<dyn StaleCacheObserver> },
    RemoveCacheObserver { cache: String, observer: Arc<dyn StaleCacheObserver> },
    BroadcastInvalidation(CacheInvalidation),

    // ─── Client directory and peer queries ───
    ClientStarted(ClientInfo),
    ClientEnded(String),
    VisitNodes(NodeVisitor),
    PeerNames(oneshot::Sender<Vec<String>>),
    OwnState(oneshot::Sender<NodeState>),
    PeerState { peer: String, reply: oneshot::Sender<Option<NodeState>> },
    PeerStatus { peer: String, reply: oneshot::Sender<Option<SessionStatus>> },
    PeerRecord { peer: String, reply: oneshot::Sender<Option<NodeRecord>> },

    // ─── Node actions and requests ───
    RegisterNodeHandler { name: String, handler: Arc<dyn NodeRequestHandler> },
    InvokeNodeAction { name: String, payload: Vec<u8>, filter: NodeFilter, reply: oneshot::Sender<Vec<String>> },
    InvokeNodeRequest { name: String, payload: Vec<u8>, filter: NodeFilter, reply: oneshot::Sender<Vec<(String, NodeAnswer)>> },

    // ─── Objects ───
    Publish { object: AttrObject, reply: oneshot::Sender<Oid> },
    SetAttribute { oid: Oid, name: String, value: Vec<u8>, reply: oneshot::Sender<PeerResult<()>> },
    Snapshot { oid: Oid, reply: oneshot::Sender<PeerResult<SharedObject>> },
    Watch { oid: Oid, reply: oneshot::Sender<PeerResult<ObjectWatch>> },
    Proxy { peer: String, remote: Oid, reply: ProxyReply },
    Unproxy { peer: String, remote: Oid, reply: oneshot::Sender<PeerResult<()>> },

    // ─── Peers ───
    RefreshPeers,
    NodesLoaded(PeerResult<Vec<NodeRecord>>),
    Session { peer: String, generation: u64, event: SessionEvent },
    InboundOpened { conn: ConnId, node_name: String, out: mpsc::UnboundedSender<PeerMessage> },
    Inbound { conn: ConnId, msg: PeerMessage },
    InboundClosed { conn: ConnId },

    Shutdown(oneshot::Sender<()>),
}

/// State owned by the coordinator task.
pub(crate) struct State {
    pub config: Arc<CoordinatorConfig>,
    pub node: NodeState,
    pub node_oid: Oid,
    /// Peers subscribed to `node`; the ratification quorum.
    pub node_fanout: Fanout,
    pub objects: ObjectTable,
    pub conns: HashMap<ConnId, InboundConn>,
    /// Outbound sessions by peer name.
    pub sessions: BTreeMap<String, PeerSession>,
    pub negotiations: HashMap<Lock, LockNegotiation>,
    next_serial: u64,
    pub cache_observers: HashMap<String, Vec<Arc<dyn StaleCacheObserver>>>,
    pub drop_observers: Vec<Arc<dyn DroppedLockObserver>>,
    pub node_handlers: HashMap<String, Arc<dyn NodeRequestHandler>>,
    pub stats: Arc<StatCounters>,
    /// A registry load is in flight.
    pub refreshing: bool,
    pub commands: mpsc::UnboundedSender<Command>,
    pub transport: Arc<dyn PeerTransport>,
    pub registry: Arc<dyn NodeRegistry>,
    shutdown: Arc<Notify>,
}

impl State {
    pub(crate) fn node_name(&self) -> &str {
        &self.node.node_name
    }

    pub(crate) fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    /// Apply a change to this node's state and replicate it.
    pub(crate) fn post_node_event(&mut self, event: NodeEvent) {
        self.node.apply(&event);
        let event = ObjectEvent::Node(event);
        self.node_fanout.notify_watchers(&event);
        let msg = PeerMessage::Event {
            oid: self.node_oid,
            event,
        };
        for conn in &self.node_fanout.subscribers {
            if let Some(c) = self.conns.get(conn) {
                c.send(msg.clone());
            }
        }
    }

    /// Apply a change to a published object and replicate it.
    pub(crate) fn post_object_event(&mut self, oid: Oid, event: ObjectEvent) -> PeerResult<()> {
        let subscribers = self.objects.apply(oid, &event)?;
        let msg = PeerMessage::Event { oid, event };
        for conn in subscribers {
            if let Some(c) = self.conns.get(&conn) {
                c.send(msg.clone());
            }
        }
        Ok(())
    }

    fn handle(&mut self, dispatch: &DispatchTable, cmd: Command) {
        match cmd {
            Command::Acquire { lock, reply } => self.acquire(lock, reply),
            Command::Release { lock, reply } => self.release(lock, reply),
            Command::Reacquire { lock, reply } => self.reacquire(lock, reply),
            Command::QueryLock { lock, reply } => {
                let _ = reply.send(self.query_lock(&lock));
            }
            Command::NegotiationTimeout { lock, serial } => self.negotiation_timed_out(lock, serial),
            Command::AddDroppedLockObserver(observer) => self.drop_observers.push(observer),
            Command::RemoveDroppedLockObserver(observer) => {
                self.drop_observers.retain(|o| !same_observer(o, &observer));
            }

            Command::AddCacheObserver { cache, observer } => {
                self.cache_observers.entry(cache).or_default().push(observer);
            }
            Command::RemoveCacheObserver { cache, observer } => {
                if let Some(list) = self.cache_observers.get_mut(&cache) {
                    list.retain(|o| !same_observer(o, &observer));
                    if list.is_empty() {
                        self.cache_observers.remove(&cache);
                    }
                }
            }
            Command::BroadcastInvalidation(data) => {
                self.post_node_event(NodeEvent::CacheData(Some(data)));
            }

            Command::ClientStarted(info) => {
                let event = if self.node.clients.contains_key(&info.username) {
                    NodeEvent::ClientUpdated(info)
                } else {
                    NodeEvent::ClientAdded(info)
                };
                self.post_node_event(event);
            }
            Command::ClientEnded(username) => {
                if self.node.clients.contains_key(&username) {
                    self.post_node_event(NodeEvent::ClientRemoved(username));
                } else {
                    warn!("peer: session ended for unregistered client {}", username);
                }
            }
            Command::VisitNodes(visit) => {
                let mut nodes = std::iter::once(&self.node)
                    .chain(self.sessions.values().filter_map(|s| s.state()));
                visit(&mut nodes);
            }
            Command::PeerNames(reply) => {
                let names = self
                    .sessions
                    .values()
                    .filter(|s| s.is_connected())
                    .map(|s| s.node_name().to_string())
                    .collect();
                let _ = reply.send(names);
            }
            Command::OwnState(reply) => {
                let _ = reply.send(self.node.clone());
            }
            Command::PeerState { peer, reply } => {
                let state = self.sessions.get(&peer).and_then(|s| s.state()).cloned();
                let _ = reply.send(state);
            }
            Command::PeerStatus { peer, reply } => {
                let _ = reply.send(self.sessions.get(&peer).map(|s| s.status()));
            }
            Command::PeerRecord { peer, reply } => {
                let _ = reply.send(self.sessions.get(&peer).map(|s| s.record().clone()));
            }

            Command::RegisterNodeHandler { name, handler } => {
                if self.node_handlers.insert(name.clone(), handler).is_some() {
                    debug!("peer: replaced node handler {}", name);
                }
            }
            Command::InvokeNodeAction {
                name,
                payload,
                filter,
                reply,
            } => {
                let _ = reply.send(self.invoke_node_action(name, payload, filter));
            }
            Command::InvokeNodeRequest {
                name,
                payload,
                filter,
                reply,
            } => {
                let _ = reply.send(self.invoke_node_request(name, payload, filter));
            }

            Command::Publish { object, reply } => {
                let oid = self.objects.register(SharedObject::Attrs(object), None);
                debug!("peer: published {}", oid);
                let _ = reply.send(oid);
            }
            Command::SetAttribute {
                oid,
                name,
                value,
                reply,
            } => {
                let _ = reply.send(self.set_attribute(oid, name, value));
            }
            Command::Snapshot { oid, reply } => {
                let _ = reply.send(self.snapshot(oid));
            }
            Command::Watch { oid, reply } => {
                let _ = reply.send(self.watch(oid));
            }
            Command::Proxy {
                peer,
                remote,
                reply,
            } => self.proxy_remote_object(peer, remote, reply),
            Command::Unproxy {
                peer,
                remote,
                reply,
            } => {
                let _ = reply.send(self.unproxy_remote_object(&peer, remote));
            }

            Command::RefreshPeers => self.refresh_peers(),
            Command::NodesLoaded(result) => self.nodes_loaded(result),
            Command::Session {
                peer,
                generation,
                event,
            } => self.session_event(peer, generation, event),
            Command::InboundOpened {
                conn,
                node_name,
                out,
            } => self.inbound_opened(conn, node_name, out),
            Command::Inbound { conn, msg } => dispatch.dispatch(self, conn, msg),
            Command::InboundClosed { conn } => self.inbound_closed(conn),

            // handled by the run loop
            Command::Shutdown(_) => {}
        }
    }

    fn set_attribute(&mut self, oid: Oid, name: String, value: Vec<u8>) -> PeerResult<()> {
        if oid == self.node_oid {
            return Err(PeerError::InvalidParms);
        }
        // Proxies mirror their owner; only the owner may change them.
        if self.objects.get(oid)?.proxy_of.is_some() {
            return Err(PeerError::InvalidParms);
        }
        self.post_object_event(oid, ObjectEvent::AttributeChanged { name, value })
    }

    fn snapshot(&self, oid: Oid) -> PeerResult<SharedObject> {
        if oid == self.node_oid {
            return Ok(SharedObject::Node(self.node.clone()));
        }
        Ok(self.objects.get(oid)?.object.clone())
    }

    fn watch(&mut self, oid: Oid) -> PeerResult<ObjectWatch> {
        if oid == self.node_oid {
            let rx = self.node_fanout.watch();
            return Ok((SharedObject::Node(self.node.clone()), rx));
        }
        let published = self.objects.get_mut(oid)?;
        let rx = published.fanout.watch();
        Ok((published.object.clone(), rx))
    }

    pub(crate) fn changed_cache_data(&self, data: &CacheInvalidation) {
        match self.cache_observers.get(&data.cache) {
            Some(observers) => {
                for observer in observers {
                    observer.changed_cache_data(&data.cache, &data.payload);
                }
            }
            None => debug!("peer: no observers for stale cache {}", data.cache),
        }
    }

    /// Registry work runs off the coordinator task.
    pub(crate) fn refresh_peers(&mut self) {
        if self.refreshing {
            debug!("peer: refresh already in progress");
            return;
        }
        self.refreshing = true;

        let registry = self.registry.clone();
        let commands = self.commands.clone();
        let record = self.config.node_record();
        tokio::spawn(async move {
            let result = async {
                // let the world know that we're alive
                if !registry.heartbeat(&record.node_name).await? {
                    registry.upsert_node(&record).await?;
                }
                registry.load_all_nodes().await
            }
            .await;
            let _ = commands.send(Command::NodesLoaded(result));
        });
    }

    /// Wind everything down. Returns once peers were told and the record
    /// is gone from the registry.
    async fn shutdown(&mut self) {
        info!("peer: shutting down {}", self.node_name());
        self.shutdown.notify_waiters();

        let names: Vec<String> = self.sessions.keys().cloned().collect();
        for name in names {
            self.disconnect_peer(&name);
        }
        self.sessions.clear();
        self.conns.clear();

        for (_, neg) in self.negotiations.drain() {
            for waiter in neg.waiters {
                let _ = waiter.reply.send(Err(PeerError::Shutdown));
            }
        }

        if let Err(e) = self.transport.shutdown().await {
            warn!("peer: {} transport shutdown failed: {}", self.transport.name(), e);
        }
        if let Err(e) = self.registry.delete_node(self.node_name()).await {
            warn!("peer: failed to remove {} from registry: {}", self.node_name(), e);
        }
    }
}

async fn run(mut state: State, mut commands: mpsc::UnboundedReceiver<Command>) {
    let dispatch = DispatchTable::new();
    while let Some(cmd) = commands.recv().await {
        if let Command::Shutdown(reply) = cmd {
            state.shutdown().await;
            let _ = reply.send(());
            return;
        }
        state.handle(&dispatch, cmd);
    }
    error!("peer: command channel closed");
}

/// Kick off a discovery cycle after `refresh_delay`, then every
/// `discovery_interval` +/- `heartbeat_jitter`.
fn spawn_refresher(config: Arc<CoordinatorConfig>, commands: mpsc::UnboundedSender<Command>, shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        let mut delay = config.refresh_delay;
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = time::sleep(delay) => {
                    if commands.send(Command::RefreshPeers).is_err() {
                        break;
                    }
                }
            }
            let jitter = config.heartbeat_jitter.as_millis() as i64;
            let offset = if jitter > 0 {
                rand::thread_rng().gen_range(-jitter..=jitter)
            } else {
                0
            };
            let base = config.discovery_interval.as_millis() as i64;
            delay = time::Duration::from_millis((base + offset).max(1) as u64);
        }
    });
}

/// Builder for [`PeerCoordinator`].
pub struct PeerCoordinatorBuilder {
    config: CoordinatorConfig,
    transport: Arc<dyn PeerTransport>,
    registry: Arc<dyn NodeRegistry>,
    user_auth: Option<Arc<dyn Authenticator>>,
}

impl PeerCoordinatorBuilder {
    /// Chain the host server's authenticator for non-peer credentials.
    pub fn user_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.user_auth = Some(auth);
        self
    }

    /// Bind the peer listener, register this node and start coordinating.
    pub async fn start(self) -> PeerResult<PeerCoordinator> {
        let config = Arc::new(self.config);
        let listener = self
            .transport
            .start_listener(&config.bind_addr, config.port)
            .await?;

        let mut auth = PeerAuthenticator::new(config.shared_secret.clone());
        if let Some(delegate) = self.user_auth {
            auth = auth.with_delegate(delegate);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let stats = Arc::new(StatCounters::default());

        inbound::spawn_acceptor(
            listener,
            AcceptContext {
                auth,
                node_name: config.node_name.clone(),
                node_oid: NODE_STATE_OID,
                logon_timeout: config.logon_timeout,
                commands: tx.clone(),
                stats: stats.clone(),
            },
            shutdown.clone(),
        );

        // register ourselves with the node table
        let registry = self.registry.clone();
        let record = config.node_record();
        tokio::spawn(async move {
            match registry.upsert_node(&record).await {
                Ok(()) => debug!("peer: registered {}", record),
                Err(e) => warn!("peer: failed to register {}: {}", record, e),
            }
        });

        spawn_refresher(config.clone(), tx.clone(), shutdown.clone());

        let state = State {
            config: config.clone(),
            node: NodeState::new(config.node_name.clone()),
            node_oid: NODE_STATE_OID,
            node_fanout: Fanout::default(),
            objects: ObjectTable::new(),
            conns: HashMap::new(),
            sessions: BTreeMap::new(),
            negotiations: HashMap::new(),
            next_serial: 0,
            cache_observers: HashMap::new(),
            drop_observers: Vec::new(),
            node_handlers: HashMap::new(),
            stats: stats.clone(),
            refreshing: false,
            commands: tx.clone(),
            transport: self.transport,
            registry: self.registry,
            shutdown,
        };
        tokio::spawn(run(state, rx));

        info!(
            "peer: {} coordinating on {}:{}",
            config.node_name, config.bind_addr, config.port
        );
        Ok(PeerCoordinator {
            config,
            commands: tx,
            stats,
        })
    }
}

/// Handle to a running coordinator.
#[derive(Clone)]
pub struct PeerCoordinator {
    config: Arc<CoordinatorConfig>,
    commands: mpsc::UnboundedSender<Command>,
    stats: Arc<StatCounters>,
}

impl PeerCoordinator {
    pub fn builder(
        config: CoordinatorConfig,
        transport: Arc<dyn PeerTransport>,
        registry: Arc<dyn NodeRegistry>,
    ) -> PeerCoordinatorBuilder {
        PeerCoordinatorBuilder {
            config,
            transport,
            registry,
            user_auth: None,
        }
    }

    /// Start a coordinator with no user authenticator.
    pub async fn start(
        config: CoordinatorConfig,
        transport: Arc<dyn PeerTransport>,
        registry: Arc<dyn NodeRegistry>,
    ) -> PeerResult<PeerCoordinator> {
        Self::builder(config, transport, registry).start().await
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn send(&self, cmd: Command) -> PeerResult<()> {
        self.commands.send(cmd).map_err(|_| PeerError::Shutdown)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> PeerResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| PeerError::Shutdown)
    }

    // ─── Locking ────────────────────────────────────────────────────────────

    /// Acquire `lock` for this node. Resolves with the name of the node
    /// holding the lock afterwards: this node if the acquisition succeeded,
    /// the current owner otherwise.
    pub async fn acquire_lock(&self, lock: Lock) -> PeerResult<Option<String>> {
        self.call(|reply| Command::Acquire { lock, reply }).await?
    }

    /// Release `lock`. Resolves with `None` once released, or with this
    /// node's name if the release was cancelled by [`Self::reacquire_lock`].
    pub async fn release_lock(&self, lock: Lock) -> PeerResult<Option<String>> {
        self.call(|reply| Command::Release { lock, reply }).await?
    }

    /// Cancel a release of `lock` that has not completed yet.
    pub async fn reacquire_lock(&self, lock: Lock) -> PeerResult<Option<String>> {
        self.call(|reply| Command::Reacquire { lock, reply }).await?
    }

    /// The node currently holding `lock`, as far as this node knows. Not
    /// definitive while the lock is in resolution.
    pub async fn query_lock(&self, lock: Lock) -> PeerResult<Option<String>> {
        self.call(|reply| Command::QueryLock { lock, reply }).await
    }

    /// Run `op` while holding `lock`, then release it. Fails with the
    /// owner's name if another node holds the lock.
    ///
    /// The lock is released even if `op` panics or the returned future is
    /// dropped before it completes.
    pub async fn perform_with_lock<F, Fut, T>(&self, lock: Lock, op: F) -> PeerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.acquire_lock(lock.clone()).await {
            Ok(Some(owner)) if owner == self.node_name() => {
                let guard = HeldLock {
                    coordinator: self,
                    lock: Some(lock),
                };
                let value = op().await;
                guard.release().await;
                Ok(value)
            }
            Ok(Some(owner)) => Err(PeerError::LockHeldElsewhere(owner)),
            Ok(None) => {
                warn!("lock: acquisition of {} resolved to no owner", lock);
                Err(PeerError::LockUnavailable)
            }
            Err(e) => {
                warn!("lock: acquisition of {} failed: {}", lock, e);
                Err(PeerError::LockUnavailable)
            }
        }
    }

    pub fn add_dropped_lock_observer(&self, observer: Arc<dyn DroppedLockObserver>) -> PeerResult<()> {
        self.send(Command::AddDroppedLockObserver(observer))
    }

    pub fn remove_dropped_lock_observer(&self, observer: Arc<dyn DroppedLockObserver>) -> PeerResult<()> {
        self.send(Command::RemoveDroppedLockObserver(observer))
    }

    // ─── Stale caches ───────────────────────────────────────────────────────

    pub fn add_stale_cache_observer(
        &self,
        cache: impl Into<String>,
        observer: Arc<dyn StaleCacheObserver>,
    ) -> PeerResult<()> {
        self.send(Command::AddCacheObserver {
            cache: cache.into(),
            observer,
        })
    }

    pub fn remove_stale_cache_observer(
        &self,
        cache: impl Into<String>,
        observer: Arc<dyn StaleCacheObserver>,
    ) -> PeerResult<()> {
        self.send(Command::RemoveCacheObserver {
            cache: cache.into(),
            observer,
        })
    }

    /// Tell every peer that data cached under `cache` went stale.
    pub fn broadcast_invalidation(&self, cache: impl Into<String>, payload: Vec<u8>) -> PeerResult<()> {
        self.send(Command::BroadcastInvalidation(CacheInvalidation {
            cache: cache.into(),
            payload,
        }))
    }

    // ─── Clients and peer queries ───────────────────────────────────────────

    /// A local (non-peer) client session started.
    pub fn client_session_started(&self, info: ClientInfo) -> PeerResult<()> {
        self.send(Command::ClientStarted(info))
    }

    pub fn client_session_ended(&self, username: impl Into<String>) -> PeerResult<()> {
        self.send(Command::ClientEnded(username.into()))
    }

    /// Find a client on this node or any peer.
    pub async fn locate_client(&self, username: &str) -> PeerResult<Option<ClientInfo>> {
        let username = username.to_string();
        self.lookup_across_peers(move |node| node.client(&username).cloned())
            .await
    }

    /// First `Some` that `f` returns for this node's state, then each
    /// connected peer's state in name order.
    pub async fn lookup_across_peers<T, F>(&self, mut f: F) -> PeerResult<Option<T>>
    where
        T: Send + 'static,
        F: FnMut(&NodeState) -> Option<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let visit: NodeVisitor = Box::new(move |nodes: &mut dyn Iterator<Item = &NodeState>| {
            let mut found = None;
            for node in nodes {
                found = f(node);
                if found.is_some() {
                    break;
                }
            }
            let _ = tx.send(found);
        });
        self.send(Command::VisitNodes(visit))?;
        rx.await.map_err(|_| PeerError::Shutdown)
    }

    /// Run `f` over this node's state and every connected peer's state.
    pub async fn apply_to_all_peers<F>(&self, mut f: F) -> PeerResult<()>
    where
        F: FnMut(&NodeState) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let visit: NodeVisitor = Box::new(move |nodes: &mut dyn Iterator<Item = &NodeState>| {
            for node in nodes {
                f(node);
            }
            let _ = tx.send(());
        });
        self.send(Command::VisitNodes(visit))?;
        rx.await.map_err(|_| PeerError::Shutdown)
    }

    /// Names of the peers this node is currently connected to.
    pub async fn peer_names(&self) -> PeerResult<Vec<String>> {
        self.call(Command::PeerNames).await
    }

    /// Snapshot of this node's own state.
    pub async fn node_state(&self) -> PeerResult<NodeState> {
        self.call(Command::OwnState).await
    }

    /// Snapshot of a connected peer's state.
    pub async fn peer_state(&self, peer: &str) -> PeerResult<Option<NodeState>> {
        let peer = peer.to_string();
        self.call(|reply| Command::PeerState { peer, reply }).await
    }

    /// Registry record of a peer this node has a session for: its internal
    /// and public host names and its port.
    pub async fn peer_record(&self, peer: &str) -> PeerResult<Option<NodeRecord>> {
        let peer = peer.to_string();
        self.call(|reply| Command::PeerRecord { peer, reply }).await
    }

    /// Connection status of the session to `peer`, `None` if the registry
    /// never listed it.
    pub async fn peer_status(&self, peer: &str) -> PeerResult<Option<SessionStatus>> {
        let peer = peer.to_string();
        self.call(|reply| Command::PeerStatus { peer, reply }).await
    }

    // ─── Objects ────────────────────────────────────────────────────────────

    /// Publish an attribute object for peers to subscribe to.
    pub async fn publish_object(&self, object: AttrObject) -> PeerResult<Oid> {
        self.call(|reply| Command::Publish { object, reply }).await
    }

    pub async fn set_object_attribute(
        &self,
        oid: Oid,
        name: impl Into<String>,
        value: Vec<u8>,
    ) -> PeerResult<()> {
        let name = name.into();
        self.call(|reply| Command::SetAttribute {
            oid,
            name,
            value,
            reply,
        })
        .await?
    }

    pub async fn object_snapshot(&self, oid: Oid) -> PeerResult<SharedObject> {
        self.call(|reply| Command::Snapshot { oid, reply }).await?
    }

    /// Current state of an object plus a stream of its subsequent changes.
    pub async fn watch_object(&self, oid: Oid) -> PeerResult<ObjectWatch> {
        self.call(|reply| Command::Watch { oid, reply }).await?
    }

    /// Subscribe to object `remote` on `peer` and republish it locally.
    /// Resolves with the local oid once the peer delivered the object.
    pub async fn proxy_remote_object(&self, peer: &str, remote: Oid) -> PeerResult<Oid> {
        let peer = peer.to_string();
        self.call(|reply| Command::Proxy {
            peer,
            remote,
            reply,
        })
        .await?
    }

    /// Drop a proxy. The caller makes sure nothing local still uses it.
    pub async fn unproxy_remote_object(&self, peer: &str, remote: Oid) -> PeerResult<()> {
        let peer = peer.to_string();
        self.call(|reply| Command::Unproxy {
            peer,
            remote,
            reply,
        })
        .await?
    }

    // ─── Node actions and requests ──────────────────────────────────────────

    /// Answer node actions and requests named `name` with `handler`,
    /// replacing any handler registered under that name before.
    pub fn register_node_handler(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn NodeRequestHandler>,
    ) -> PeerResult<()> {
        self.send(Command::RegisterNodeHandler {
            name: name.into(),
            handler,
        })
    }

    /// Names of this node and the connected peers whose state `filter`
    /// accepts.
    pub async fn find_applicable_nodes<F>(&self, filter: F) -> PeerResult<Vec<String>>
    where
        F: Fn(&NodeState) -> bool + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let visit: NodeVisitor = Box::new(move |nodes: &mut dyn Iterator<Item = &NodeState>| {
            let mut names = Vec::new();
            for node in nodes {
                if filter(node) {
                    names.push(node.node_name.clone());
                }
            }
            let _ = tx.send(names);
        });
        self.send(Command::VisitNodes(visit))?;
        rx.await.map_err(|_| PeerError::Shutdown)
    }

    /// Run the handler `name` on every node `filter` accepts, without
    /// waiting for the outcome. Resolves with the nodes it went to; an
    /// empty list means no node matched.
    pub async fn invoke_node_action<F>(
        &self,
        name: impl Into<String>,
        payload: Vec<u8>,
        filter: F,
    ) -> PeerResult<Vec<String>>
    where
        F: Fn(&NodeState) -> bool + Send + 'static,
    {
        let name = name.into();
        self.call(|reply| Command::InvokeNodeAction {
            name,
            payload,
            filter: Box::new(filter),
            reply,
        })
        .await
    }

    /// Run the handler `name` on every node `filter` accepts and collect
    /// what each one answered. A peer that disconnects before answering
    /// yields `NotConnected`.
    pub async fn invoke_node_request<F>(
        &self,
        name: impl Into<String>,
        payload: Vec<u8>,
        filter: F,
    ) -> PeerResult<BTreeMap<String, PeerResult<Vec<u8>>>>
    where
        F: Fn(&NodeState) -> bool + Send + 'static,
    {
        let name = name.into();
        let answers = self
            .call(|reply| Command::InvokeNodeRequest {
                name,
                payload,
                filter: Box::new(filter),
                reply,
            })
            .await?;

        let mut results = BTreeMap::new();
        for (node, answer) in answers {
            let result = match answer.await {
                Ok(Ok(PeerReply::Node(bytes))) => Ok(bytes),
                Ok(Ok(other)) => Err(PeerError::Protocol(format!("unexpected reply {:?}", other))),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(PeerError::NotConnected(node.clone())),
            };
            results.insert(node, result);
        }
        Ok(results)
    }

    // ─── Life cycle ─────────────────────────────────────────────────────────

    /// Counters since this coordinator started.
    pub fn stats(&self) -> PeerStats {
        self.stats.snapshot()
    }

    /// Run a discovery cycle now instead of waiting for the next tick.
    pub fn refresh_peers(&self) -> PeerResult<()> {
        self.send(Command::RefreshPeers)
    }

    /// Log off every peer, stop listening and remove this node's record.
    pub async fn shutdown(&self) -> PeerResult<()> {
        self.call(Command::Shutdown).await
    }
}

/// A lock taken by [`PeerCoordinator::perform_with_lock`]. Posts a release
/// if dropped while still held.
struct HeldLock<'a> {
    coordinator: &'a PeerCoordinator,
    lock: Option<Lock>,
}

impl HeldLock<'_> {
    async fn release(mut self) {
        let Some(lock) = self.lock.clone() else {
            return;
        };
        if let Err(e) = self.coordinator.release_lock(lock.clone()).await {
            warn!("lock: failed to release {} after use: {}", lock, e);
        }
        self.lock = None;
    }
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            warn!("lock: operation holding {} did not finish, releasing", lock);
            let (reply, _) = oneshot::channel();
            if let Err(e) = self.coordinator.send(Command::Release { lock, reply }) {
                debug!("lock: could not release abandoned lock: {}", e);
            }
        }
    }
}
