//! In-process peer transport.
//!
//! A shared [`LocalNetwork`] broker routes links between any number of
//! [`LocalTransport`] instances living in the same process, so that a whole
//! cluster can be simulated without sockets. Messages are passed through
//! tokio channels as-is; nothing is serialized.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use nodemesh_proto::defaults::{DEFAULT_ACCEPT_CHANNEL_SIZE, DEFAULT_LINK_CHANNEL_SIZE};
use nodemesh_proto::error::{PeerError, PeerResult};
use nodemesh_proto::message::PeerMessage;

use crate::transport::{Link, PeerListener, PeerTransport};

fn addr_key(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

/// Shared network broker. Routes links between `LocalTransport` instances.
#[derive(Clone, Debug, Default)]
pub struct LocalNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<Link>>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything is listening on `host:port`.
    pub async fn is_listening(&self, host: &str, port: u16) -> bool {
        self.listeners.lock().await.contains_key(&addr_key(host, port))
    }
}

/// In-memory `PeerTransport` implementation.
pub struct LocalTransport {
    network: LocalNetwork,
    /// Addresses this transport registered, removed again on shutdown.
    bound: Mutex<Vec<String>>,
}

impl LocalTransport {
    pub fn new(network: &LocalNetwork) -> Self {
        Self {
            network: network.clone(),
            bound: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PeerTransport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    async fn connect(&self, host: &str, port: u16) -> PeerResult<Link> {
        let key = addr_key(host, port);
        let accept_tx = {
            let listeners = self.network.listeners.lock().await;
            listeners.get(&key).cloned().ok_or(PeerError::PeerOffline)?
        };

        let (to_remote_tx, to_remote_rx) = mpsc::channel::<PeerMessage>(DEFAULT_LINK_CHANNEL_SIZE);
        let (to_local_tx, to_local_rx) = mpsc::channel::<PeerMessage>(DEFAULT_LINK_CHANNEL_SIZE);

        let remote_end = Link {
            remote: format!("local-client->{}", key),
            tx: to_local_tx,
            rx: to_remote_rx,
        };
        accept_tx
            .send(remote_end)
            .await
            .map_err(|_| PeerError::PeerOffline)?;

        debug!("local: connected to {}", key);
        Ok(Link {
            remote: key,
            tx: to_remote_tx,
            rx: to_local_rx,
        })
    }

    async fn start_listener(&self, bind_host: &str, port: u16) -> PeerResult<Box<dyn PeerListener>> {
        let key = addr_key(bind_host, port);
        let (tx, rx) = mpsc::channel::<Link>(DEFAULT_ACCEPT_CHANNEL_SIZE);
        {
            let mut listeners = self.network.listeners.lock().await;
            if listeners.contains_key(&key) {
                return Err(PeerError::NetworkError);
            }
            listeners.insert(key.clone(), tx);
        }
        self.bound.lock().await.push(key.clone());
        debug!("local: listening on {}", key);
        Ok(Box::new(LocalListener { rx: Mutex::new(rx) }))
    }

    async fn shutdown(&self) -> PeerResult<()> {
        let keys: Vec<String> = self.bound.lock().await.drain(..).collect();
        let mut listeners = self.network.listeners.lock().await;
        for key in keys {
            listeners.remove(&key);
        }
        Ok(())
    }
}

struct LocalListener {
    rx: Mutex<mpsc::Receiver<Link>>,
}

#[async_trait]
impl PeerListener for LocalListener {
    async fn accept(&self) -> PeerResult<Link> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(PeerError::Shutdown)
    }
}
