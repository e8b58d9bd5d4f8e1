//! Multi-node scenarios over the in-process transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nodemesh::{
    Authenticator, CoordinatorConfig, CronJob, PeerCoordinator, ScheduledJobCoordinator,
    SessionStatus,
};
use nodemesh_core::{LocalNetwork, LocalTransport, Link, MemoryRegistry, NodeRegistry, PeerTransport};
use nodemesh_proto::node::now_millis;
use nodemesh_proto::{
    AttrObject, ClientInfo, Credentials, Lock, NodeEvent, NodeRecord, ObjectEvent, PeerCreds,
    PeerError, PeerMessage, PeerResult, SharedObject, NODE_STATE_OID,
};

const SECRET: &str = "cluster-secret";
const PORT: u16 = 47624;

struct Cluster {
    network: LocalNetwork,
    registry: MemoryRegistry,
}

impl Cluster {
    fn new() -> Self {
        Self {
            network: LocalNetwork::new(),
            registry: MemoryRegistry::new(),
        }
    }

    fn config(&self, name: &str) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::new(name, SECRET, name, PORT);
        config.bind_addr = name.to_string();
        config.lock_timeout = Duration::from_millis(1500);
        // discovery is driven by the tests
        config.refresh_delay = Duration::from_secs(3600);
        config.heartbeat_jitter = Duration::ZERO;
        config
    }

    async fn start(&self, name: &str) -> PeerCoordinator {
        self.start_with(self.config(name)).await
    }

    async fn start_with(&self, config: CoordinatorConfig) -> PeerCoordinator {
        PeerCoordinator::start(
            config,
            Arc::new(LocalTransport::new(&self.network)),
            Arc::new(self.registry.clone()),
        )
        .await
        .expect("coordinator should start")
    }

    /// A raw peer that logs on to `target` and subscribes to its node state
    /// but never ratifies anything.
    async fn mute_subscriber(&self, target: &str) -> Link {
        let transport = LocalTransport::new(&self.network);
        let mut link = transport.connect(target, PORT).await.unwrap();
        link.tx
            .send(PeerMessage::Logon {
                creds: Credentials::Peer(PeerCreds::new("mute", SECRET)),
            })
            .await
            .unwrap();
        assert!(matches!(link.rx.recv().await, Some(PeerMessage::LogonAck { .. })));
        link.tx
            .send(PeerMessage::Subscribe { oid: NODE_STATE_OID })
            .await
            .unwrap();
        assert!(matches!(
            link.rx.recv().await,
            Some(PeerMessage::ObjectAvailable { .. })
        ));
        link
    }
}

/// Poll a condition until it holds or five seconds pass.
macro_rules! eventually {
    ($what:expr, $check:expr) => {{
        let deadline = Instant::now() + Duration::from_secs(5);
        while !$check {
            assert!(Instant::now() < deadline, "timed out waiting for {}", $what);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }};
}

/// Run discovery on `nodes` until every one of them is connected to `peers`
/// others.
async fn connect(nodes: &[&PeerCoordinator], peers: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut done = true;
        for node in nodes {
            if node.peer_names().await.unwrap().len() < peers {
                node.refresh_peers().unwrap();
                done = false;
            }
        }
        if done {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for peers to connect");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn mesh(nodes: &[&PeerCoordinator]) {
    connect(nodes, nodes.len() - 1).await;
}

async fn holds(node: &PeerCoordinator, lock: &Lock) -> bool {
    node.node_state().await.unwrap().holds(lock)
}

#[tokio::test]
async fn test_lock_held_by_one_node_at_a_time() {
    let cluster = Cluster::new();
    let alpha = cluster.start("alpha").await;
    let beta = cluster.start("beta").await;
    mesh(&[&alpha, &beta]).await;

    let lock = Lock::new("room", "12");
    assert_eq!(alpha.acquire_lock(lock.clone()).await.unwrap(), Some("alpha".into()));
    assert_eq!(beta.acquire_lock(lock.clone()).await.unwrap(), Some("alpha".into()));
    assert!(holds(&alpha, &lock).await);
    assert!(!holds(&beta, &lock).await);

    assert_eq!(alpha.release_lock(lock.clone()).await.unwrap(), None);
    assert_eq!(beta.acquire_lock(lock.clone()).await.unwrap(), Some("beta".into()));
    assert!(!holds(&alpha, &lock).await);
    assert!(holds(&beta, &lock).await);

    eventually!(
        "alpha to see beta's lock",
        alpha.query_lock(lock.clone()).await.unwrap() == Some("beta".into())
    );

    alpha.shutdown().await.unwrap();
    beta.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_lone_node_is_granted_immediately() {
    let cluster = Cluster::new();
    let solo = cluster.start("solo").await;

    let lock = Lock::new("room", "1");
    let started = Instant::now();
    assert_eq!(solo.acquire_lock(lock.clone()).await.unwrap(), Some("solo".into()));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(holds(&solo, &lock).await);
    assert_eq!(solo.query_lock(lock.clone()).await.unwrap(), Some("solo".into()));

    let state = solo.node_state().await.unwrap();
    assert_eq!(state.acquiring_lock, None);
    solo.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_negotiation_activates_after_timeout() {
    let cluster = Cluster::new();
    let mut config = cluster.config("alpha");
    config.lock_timeout = Duration::from_millis(300);
    let alpha = cluster.start_with(config).await;
    let mut mute = cluster.mute_subscriber("alpha").await;

    let lock = Lock::new("room", "7");
    let started = Instant::now();
    assert_eq!(alpha.acquire_lock(lock.clone()).await.unwrap(), Some("alpha".into()));
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert!(holds(&alpha, &lock).await);

    // the subscriber saw the signal, the lock, then the signal cleared
    let mut seen = Vec::new();
    while seen.len() < 3 {
        match mute.rx.recv().await {
            Some(PeerMessage::Event {
                event: ObjectEvent::Node(ev),
                ..
            }) => seen.push(ev),
            Some(_) => {}
            None => break,
        }
    }
    assert_eq!(
        seen,
        vec![
            NodeEvent::AcquiringLock(Some(lock.clone())),
            NodeEvent::LockAdded(lock.clone()),
            NodeEvent::AcquiringLock(None),
        ]
    );
    assert_eq!(alpha.stats().lock_timeouts, 1);
    alpha.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_smaller_name_wins_simultaneous_acquire() {
    let cluster = Cluster::new();
    let alpha = cluster.start("alpha").await;
    let beta = cluster.start("beta").await;
    mesh(&[&alpha, &beta]).await;

    let first = Lock::new("room", "a");
    let (a, b) = tokio::join!(alpha.acquire_lock(first.clone()), beta.acquire_lock(first.clone()));
    assert_eq!(a.unwrap(), Some("alpha".into()));
    assert_eq!(b.unwrap(), Some("alpha".into()));

    let second = Lock::new("room", "b");
    let (b, a) = tokio::join!(beta.acquire_lock(second.clone()), alpha.acquire_lock(second.clone()));
    assert_eq!(a.unwrap(), Some("alpha".into()));
    assert_eq!(b.unwrap(), Some("alpha".into()));

    assert!(holds(&alpha, &first).await && holds(&alpha, &second).await);
    assert!(!holds(&beta, &first).await && !holds(&beta, &second).await);

    alpha.shutdown().await.unwrap();
    beta.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_conflicting_lock_is_dropped_on_logon() {
    let cluster = Cluster::new();
    let alpha = cluster.start("alpha").await;
    let beta = cluster.start("beta").await;

    let dropped = Arc::new(AtomicUsize::new(0));
    let counter = dropped.clone();
    alpha
        .add_dropped_lock_observer(Arc::new(move |_: &Lock| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    // both nodes grant themselves the lock while they cannot see each other
    let lock = Lock::new("room", "9");
    assert_eq!(alpha.acquire_lock(lock.clone()).await.unwrap(), Some("alpha".into()));
    assert_eq!(beta.acquire_lock(lock.clone()).await.unwrap(), Some("beta".into()));

    // only alpha connects, and finds beta already holding it
    connect(&[&alpha], 1).await;
    eventually!("alpha to yield", dropped.load(Ordering::SeqCst) == 1);

    assert!(!holds(&alpha, &lock).await);
    assert!(holds(&beta, &lock).await);
    assert_eq!(alpha.query_lock(lock.clone()).await.unwrap(), Some("beta".into()));
    assert_eq!(alpha.stats().locks_hijacked, 1);
    assert_eq!(beta.stats().locks_hijacked, 0);

    alpha.shutdown().await.unwrap();
    beta.shutdown().await.unwrap();
}

struct Nightly {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl CronJob for Nightly {
    fn name(&self) -> &str {
        "nightly-report"
    }

    async fn run(&self) -> PeerResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_cron_job_runs_on_one_node() {
    let cluster = Cluster::new();
    let alpha = cluster.start("alpha").await;
    let beta = cluster.start("beta").await;
    let gamma = cluster.start("gamma").await;
    mesh(&[&alpha, &beta, &gamma]).await;

    let runs = Arc::new(AtomicUsize::new(0));
    let mut crons = Vec::new();
    for node in [&alpha, &beta, &gamma] {
        let cron = ScheduledJobCoordinator::new(node.clone(), node.config());
        cron.schedule_at(2, Arc::new(Nightly { runs: runs.clone() }))
            .unwrap();
        crons.push(cron);
    }

    let minute = crons[0].scheduled_minutes("nightly-report")[0];
    let handles: Vec<_> = crons.iter().flat_map(|cron| cron.execute_jobs(minute)).collect();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // the winner let go of the lock afterwards
    let lock = Lock::cron("nightly-report");
    eventually!(
        "the cron lock to be released",
        alpha.query_lock(lock.clone()).await.unwrap().is_none()
            && beta.query_lock(lock.clone()).await.unwrap().is_none()
            && gamma.query_lock(lock.clone()).await.unwrap().is_none()
    );

    for node in [&alpha, &beta, &gamma] {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_reacquire_cancels_pending_release() {
    let cluster = Cluster::new();
    let alpha = cluster.start("alpha").await;

    let lock = Lock::new("room", "3");
    assert_eq!(alpha.acquire_lock(lock.clone()).await.unwrap(), Some("alpha".into()));

    // a subscriber that never ratifies keeps the release pending
    let mut mute = cluster.mute_subscriber("alpha").await;
    let releasing = {
        let alpha = alpha.clone();
        let lock = lock.clone();
        tokio::spawn(async move { alpha.release_lock(lock).await })
    };
    eventually!(
        "the release to start",
        alpha.node_state().await.unwrap().releasing_lock == Some(lock.clone())
    );

    assert_eq!(alpha.reacquire_lock(lock.clone()).await.unwrap(), Some("alpha".into()));
    assert_eq!(releasing.await.unwrap().unwrap(), Some("alpha".into()));

    let state = alpha.node_state().await.unwrap();
    assert!(state.holds(&lock));
    assert_eq!(state.releasing_lock, None);

    let mut updated = false;
    while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(200), mute.rx.recv()).await {
        if let PeerMessage::Event {
            event: ObjectEvent::Node(NodeEvent::LockUpdated(l)),
            ..
        } = msg
        {
            updated = l == lock;
            break;
        }
    }
    assert!(updated, "subscriber should learn the release was aborted");

    // a reacquire with nothing pending just reports the owner
    assert_eq!(alpha.reacquire_lock(lock.clone()).await.unwrap(), Some("alpha".into()));
    alpha.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_proxy_of_same_object_fails() {
    let cluster = Cluster::new();
    let alpha = cluster.start("alpha").await;
    let beta = cluster.start("beta").await;
    mesh(&[&alpha, &beta]).await;

    let remote = beta.publish_object(AttrObject::default()).await.unwrap();
    let local = alpha.proxy_remote_object("beta", remote).await.unwrap();
    assert_eq!(
        alpha.proxy_remote_object("beta", remote).await,
        Err(PeerError::AlreadyProxied {
            peer: "beta".into(),
            oid: remote.0
        })
    );
    assert!(matches!(
        alpha.proxy_remote_object("nobody", remote).await,
        Err(PeerError::NotConnected(_))
    ));

    // the first proxy still mirrors the remote object
    beta.set_object_attribute(remote, "score", vec![7]).await.unwrap();
    eventually!(
        "the proxy to update",
        match alpha.object_snapshot(local).await {
            Ok(SharedObject::Attrs(obj)) => obj.get("score") == Some(&[7u8][..]),
            _ => false,
        }
    );
    assert_eq!(
        alpha.set_object_attribute(local, "score", vec![8]).await,
        Err(PeerError::InvalidParms)
    );

    alpha.unproxy_remote_object("beta", remote).await.unwrap();
    assert_eq!(
        alpha.object_snapshot(local).await,
        Err(PeerError::NoSuchObject(local.0))
    );
    assert!(matches!(
        alpha.unproxy_remote_object("beta", remote).await,
        Err(PeerError::NotProxied { .. })
    ));

    alpha.shutdown().await.unwrap();
    beta.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalidation_reaches_peer_observers() {
    let cluster = Cluster::new();
    let alpha = cluster.start("alpha").await;
    let beta = cluster.start("beta").await;
    mesh(&[&alpha, &beta]).await;

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    beta.add_stale_cache_observer(
        "tiles",
        Arc::new(move |cache: &str, payload: &[u8]| {
            assert_eq!(cache, "tiles");
            assert_eq!(payload, b"3,4");
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    alpha.broadcast_invalidation("tiles", b"3,4".to_vec()).unwrap();
    alpha.broadcast_invalidation("sprites", b"x".to_vec()).unwrap();
    eventually!("beta's observer to fire", hits.load(Ordering::SeqCst) == 1);

    alpha.shutdown().await.unwrap();
    beta.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clients_are_located_across_peers() {
    let cluster = Cluster::new();
    let alpha = cluster.start("alpha").await;
    let beta = cluster.start("beta").await;
    mesh(&[&alpha, &beta]).await;

    beta.client_session_started(ClientInfo::new("mdb").with_field("zone", "harbor"))
        .unwrap();
    eventually!("alpha to see beta's client", alpha.locate_client("mdb").await.unwrap().is_some());
    let found = alpha.locate_client("mdb").await.unwrap().unwrap();
    assert_eq!(found.fields.get("zone").map(String::as_str), Some("harbor"));

    let owner = alpha
        .lookup_across_peers(|node| node.client("mdb").map(|_| node.node_name.clone()))
        .await
        .unwrap();
    assert_eq!(owner, Some("beta".into()));

    let mut visited = Vec::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    alpha
        .apply_to_all_peers(move |node| {
            let _ = tx.send(node.node_name.clone());
        })
        .await
        .unwrap();
    while let Ok(name) = rx.try_recv() {
        visited.push(name);
    }
    assert_eq!(visited, vec!["alpha".to_string(), "beta".to_string()]);

    beta.client_session_ended("mdb").unwrap();
    eventually!("the client to disappear", alpha.locate_client("mdb").await.unwrap().is_none());

    alpha.shutdown().await.unwrap();
    beta.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_departed_peer_frees_its_locks() {
    let cluster = Cluster::new();
    let alpha = cluster.start("alpha").await;
    let beta = cluster.start("beta").await;
    mesh(&[&alpha, &beta]).await;

    let lock = Lock::new("room", "5");
    assert_eq!(beta.acquire_lock(lock.clone()).await.unwrap(), Some("beta".into()));
    eventually!(
        "alpha to see beta's lock",
        alpha.query_lock(lock.clone()).await.unwrap() == Some("beta".into())
    );
    assert_eq!(alpha.peer_status("beta").await.unwrap(), Some(SessionStatus::Connected));
    assert_eq!(alpha.peer_status("gamma").await.unwrap(), None);

    beta.shutdown().await.unwrap();
    eventually!("beta's lock to be freed", alpha.query_lock(lock.clone()).await.unwrap().is_none());
    assert!(alpha.peer_names().await.unwrap().is_empty());
    assert_ne!(alpha.peer_status("beta").await.unwrap(), Some(SessionStatus::Connected));
    assert_eq!(alpha.acquire_lock(lock.clone()).await.unwrap(), Some("alpha".into()));
    assert_eq!(beta.acquire_lock(lock).await, Err(PeerError::Shutdown));

    alpha.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_interrupted_operation_releases_its_lock() {
    let cluster = Cluster::new();
    let alpha = cluster.start("alpha").await;

    let lock = Lock::new("room", "13");
    let worker = alpha.clone();
    let held = lock.clone();
    let outcome = tokio::spawn(async move {
        worker
            .perform_with_lock(held, || async { panic!("operation blew up") })
            .await
    })
    .await;
    assert!(outcome.unwrap_err().is_panic());
    eventually!("the lock to be released after the panic", alpha.query_lock(lock.clone()).await.unwrap().is_none());

    let stalled = tokio::time::timeout(
        Duration::from_millis(100),
        alpha.perform_with_lock(lock.clone(), || std::future::pending::<()>()),
    )
    .await;
    assert!(stalled.is_err());
    eventually!("the lock to be released after the timeout", alpha.query_lock(lock.clone()).await.unwrap().is_none());

    let value = alpha.perform_with_lock(lock.clone(), || async { 7 }).await.unwrap();
    assert_eq!(value, 7);
    assert_eq!(alpha.query_lock(lock).await.unwrap(), None);
    assert_eq!(alpha.stats().locks_acquired, 3);

    alpha.shutdown().await.unwrap();
}

/// Lets users in whose password is `ticket-<name>`.
struct Tickets;

impl Authenticator for Tickets {
    fn authenticate(&self, username: &str, password: &str) -> PeerResult<()> {
        if password == format!("ticket-{}", username) {
            Ok(())
        } else {
            Err(PeerError::AuthRejected)
        }
    }
}

#[tokio::test]
async fn test_user_logon_lists_client_across_peers() {
    let cluster = Cluster::new();
    let alpha = PeerCoordinator::builder(
        cluster.config("alpha"),
        Arc::new(LocalTransport::new(&cluster.network)),
        Arc::new(cluster.registry.clone()),
    )
    .user_authenticator(Arc::new(Tickets))
    .start()
    .await
    .unwrap();
    let beta = cluster.start("beta").await;
    mesh(&[&alpha, &beta]).await;

    let transport = LocalTransport::new(&cluster.network);
    let mut link = transport.connect("alpha", PORT).await.unwrap();
    link.tx
        .send(PeerMessage::Logon {
            creds: Credentials::User {
                username: "mdb".into(),
                password: "ticket-mdb".into(),
            },
        })
        .await
        .unwrap();
    assert!(matches!(link.rx.recv().await, Some(PeerMessage::LogonAck { .. })));
    eventually!("beta to locate the user", beta.locate_client("mdb").await.unwrap().is_some());

    drop(link);
    eventually!("the user to be gone", beta.locate_client("mdb").await.unwrap().is_none());

    // beta chained no authenticator
    let mut refused = transport.connect("beta", PORT).await.unwrap();
    refused
        .tx
        .send(PeerMessage::Logon {
            creds: Credentials::User {
                username: "mdb".into(),
                password: "ticket-mdb".into(),
            },
        })
        .await
        .unwrap();
    assert!(matches!(
        refused.rx.recv().await,
        Some(PeerMessage::LogonFailed { .. })
    ));

    alpha.shutdown().await.unwrap();
    beta.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_node_actions_and_requests() {
    let cluster = Cluster::new();
    let alpha = cluster.start("alpha").await;
    let beta = cluster.start("beta").await;
    mesh(&[&alpha, &beta]).await;

    let runs = Arc::new(AtomicUsize::new(0));
    for node in [&alpha, &beta] {
        let name = node.node_name().to_string();
        let counter = runs.clone();
        node.register_node_handler(
            "whoami",
            Arc::new(move |payload: &[u8]| -> PeerResult<Vec<u8>> {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut reply = name.clone().into_bytes();
                reply.extend_from_slice(payload);
                Ok(reply)
            }),
        )
        .unwrap();
    }

    beta.client_session_started(ClientInfo::new("mdb")).unwrap();
    eventually!("alpha to see beta's client", alpha.locate_client("mdb").await.unwrap().is_some());
    let hosting = alpha
        .find_applicable_nodes(|node| node.client("mdb").is_some())
        .await
        .unwrap();
    assert_eq!(hosting, vec!["beta"]);
    assert_eq!(
        alpha.find_applicable_nodes(|_| true).await.unwrap(),
        vec!["alpha", "beta"]
    );

    let answers = alpha
        .invoke_node_request("whoami", b"!".to_vec(), |_| true)
        .await
        .unwrap();
    assert_eq!(answers.get("alpha"), Some(&Ok(b"alpha!".to_vec())));
    assert_eq!(answers.get("beta"), Some(&Ok(b"beta!".to_vec())));
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    let unknown = alpha
        .invoke_node_request("nobody", Vec::new(), |node| node.node_name == "beta")
        .await
        .unwrap();
    assert_eq!(
        unknown.get("beta"),
        Some(&Err(PeerError::NoSuchHandler("nobody".into())))
    );
    assert_eq!(unknown.len(), 1);

    let invoked = alpha
        .invoke_node_action("whoami", Vec::new(), |node| node.client("mdb").is_some())
        .await
        .unwrap();
    assert_eq!(invoked, vec!["beta"]);
    eventually!("beta to run the action", runs.load(Ordering::SeqCst) == 3);

    let dropped = alpha.invoke_node_action("whoami", Vec::new(), |_| false).await.unwrap();
    assert!(dropped.is_empty());
    assert_eq!(alpha.stats().node_actions_invoked, 1);

    alpha.shutdown().await.unwrap();
    beta.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stats_count_locks_and_messages() {
    let cluster = Cluster::new();
    let alpha = cluster.start("alpha").await;
    let beta = cluster.start("beta").await;
    mesh(&[&alpha, &beta]).await;

    let linked = alpha.stats();
    assert!(linked.messages_in > 0);
    assert!(linked.messages_out > 0);

    let lock = Lock::new("room", "21");
    assert_eq!(alpha.acquire_lock(lock.clone()).await.unwrap(), Some("alpha".into()));
    assert_eq!(alpha.release_lock(lock).await.unwrap(), None);

    let stats = alpha.stats();
    assert_eq!(stats.locks_acquired, 1);
    assert_eq!(stats.locks_released, 1);
    assert_eq!(stats.lock_timeouts, 0);
    // beta's ratifications came in, our answers went out
    assert!(stats.messages_in > linked.messages_in);
    assert!(stats.messages_out > linked.messages_out);
    assert_eq!(beta.stats().locks_acquired, 0);

    alpha.shutdown().await.unwrap();
    beta.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_inbound_logon_makes_the_node_connect_back() {
    let cluster = Cluster::new();
    let alpha = cluster.start("alpha").await;
    let beta = cluster.start("beta").await;

    // only beta runs discovery
    connect(&[&beta], 1).await;
    eventually!(
        "alpha to connect back",
        alpha.peer_names().await.unwrap() == vec!["beta".to_string()]
    );

    let record = alpha.peer_record("beta").await.unwrap().unwrap();
    assert_eq!(record.host_name, "beta");
    assert_eq!(record.public_host_name, "beta");
    assert_eq!(record.port, PORT);
    assert_eq!(alpha.peer_record("gamma").await.unwrap(), None);

    alpha.shutdown().await.unwrap();
    beta.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stale_peer_is_disconnected() {
    let cluster = Cluster::new();
    let alpha = cluster.start("alpha").await;
    let beta = cluster.start("beta").await;
    mesh(&[&alpha, &beta]).await;

    // beta stops heartbeating but its link stays up
    let mut stale = NodeRecord::new("beta", "beta", None, PORT);
    stale.last_updated = now_millis() - 86_400_000;
    cluster.registry.upsert_node(&stale).await.unwrap();

    // a discovery cycle kicked off by beta's logon may still be in flight
    eventually!("alpha to drop beta", {
        alpha.refresh_peers().unwrap();
        alpha.peer_names().await.unwrap().is_empty()
    });
    assert_eq!(alpha.peer_status("beta").await.unwrap(), None);

    alpha.shutdown().await.unwrap();
    beta.shutdown().await.unwrap();
}
