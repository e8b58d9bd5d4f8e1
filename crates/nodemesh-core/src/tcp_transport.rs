//! TCP peer transport, the default implementation.
//!
//! Wire format: every message is a 4-byte little-endian u32 giving the size
//! of the bincode-encoded [`PeerMessage`], followed by the encoded bytes.
//!
//! Each link is served by two tasks: a writer that drains the outbound
//! channel onto the socket, and a reader that decodes frames into the
//! inbound channel.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, warn};

use nodemesh_proto::defaults::{
    DEFAULT_ACCEPT_CHANNEL_SIZE, DEFAULT_LINK_CHANNEL_SIZE, DEFAULT_MAX_FRAME_SIZE,
};
use nodemesh_proto::error::{PeerError, PeerResult};
use nodemesh_proto::message::PeerMessage;

use crate::transport::{Link, PeerListener, PeerTransport};

// ─── Wire helpers ─────────────────────────────────────────────────────────────

/// Write a length-prefixed, bincode-encoded message to a stream.
pub async fn write_message(
    stream: &mut (impl AsyncWriteExt + Unpin),
    msg: &PeerMessage,
    max_frame: u32,
) -> PeerResult<()> {
    let encoded = bincode::serialize(msg)?;
    if encoded.len() > max_frame as usize {
        return Err(PeerError::FrameTooLarge(encoded.len()));
    }
    stream
        .write_all(&(encoded.len() as u32).to_le_bytes())
        .await?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a length-prefixed, bincode-encoded message from a stream.
pub async fn read_message(
    stream: &mut (impl AsyncReadExt + Unpin),
    max_frame: u32,
) -> PeerResult<PeerMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > max_frame {
        return Err(PeerError::FrameTooLarge(len as usize));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

// ─── PeerTransport implementation ─────────────────────────────────────────────

/// TCP-based peer transport.
pub struct TcpTransport {
    max_frame: u32,
    shutdown: Arc<Notify>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame: u32) -> Self {
        Self {
            max_frame,
            shutdown: Arc::new(Notify::new()),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn connect(&self, host: &str, port: u16) -> PeerResult<Link> {
        let target = format!("{}:{}", host, port);
        debug!("tcp: connecting to {}", target);
        let stream = TcpStream::connect(&target).await?;
        stream.set_nodelay(true).ok();
        Ok(spawn_link(stream, target, self.max_frame, self.shutdown.clone()))
    }

    async fn start_listener(&self, bind_host: &str, port: u16) -> PeerResult<Box<dyn PeerListener>> {
        let addr = format!("{}:{}", bind_host, port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            error!("tcp: failed to bind {}: {}", addr, e);
            PeerError::from(e)
        })?;
        info!("tcp: listening on {}", addr);

        let (tx, rx) = mpsc::channel::<Link>(DEFAULT_ACCEPT_CHANNEL_SIZE);
        let shutdown = self.shutdown.clone();
        let max_frame = self.max_frame;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!("tcp: listener on {} shutting down", addr);
                        break;
                    }
                    accept = listener.accept() => {
                        match accept {
                            Ok((stream, peer_addr)) => {
                                debug!("tcp: accepted connection from {}", peer_addr);
                                stream.set_nodelay(true).ok();
                                let link = spawn_link(
                                    stream,
                                    peer_addr.to_string(),
                                    max_frame,
                                    shutdown.clone(),
                                );
                                if tx.send(link).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("tcp: accept error: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::new(TcpPeerListener { rx: Mutex::new(rx) }))
    }

    async fn shutdown(&self) -> PeerResult<()> {
        self.shutdown.notify_waiters();
        Ok(())
    }
}

/// Bridge a connected socket to a pair of message channels.
fn spawn_link(stream: TcpStream, remote: String, max_frame: u32, shutdown: Arc<Notify>) -> Link {
    let (read_half, write_half) = stream.into_split();
    let mut reader = tokio::io::BufReader::new(read_half);
    let mut writer = tokio::io::BufWriter::new(write_half);

    let (out_tx, mut out_rx) = mpsc::channel::<PeerMessage>(DEFAULT_LINK_CHANNEL_SIZE);
    let (in_tx, in_rx) = mpsc::channel::<PeerMessage>(DEFAULT_LINK_CHANNEL_SIZE);

    // Writer task: ends when every sender of the outbound channel is gone.
    let shutdown_w = shutdown.clone();
    let remote_w = remote.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_w.notified() => break,
                msg = out_rx.recv() => {
                    match msg {
                        Some(m) => {
                            if let Err(e) = write_message(&mut writer, &m, max_frame).await {
                                debug!("tcp: write to {} failed: {}", remote_w, e);
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = writer.shutdown().await;
    });

    // Reader task: dropping `in_tx` tells the link owner the remote is gone.
    let remote_r = remote.clone();
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = shutdown.notified() => break,
                result = read_message(&mut reader, max_frame) => {
                    match result {
                        Ok(m) => m,
                        Err(e) => {
                            debug!("tcp: link to {} closed: {}", remote_r, e);
                            break;
                        }
                    }
                }
            };
            if in_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    Link {
        remote,
        tx: out_tx,
        rx: in_rx,
    }
}

// ─── PeerListener implementation ──────────────────────────────────────────────

struct TcpPeerListener {
    rx: Mutex<mpsc::Receiver<Link>>,
}

#[async_trait]
impl PeerListener for TcpPeerListener {
    async fn accept(&self) -> PeerResult<Link> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(PeerError::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodemesh_proto::node::{Credentials, PeerCreds};

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let msg = PeerMessage::Logon {
            creds: Credentials::Peer(PeerCreds::new("node-a", "secret")),
        };
        write_message(&mut a, &msg, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        let got = read_message(&mut b, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&(1000u32).to_le_bytes()).await.unwrap();
        let err = read_message(&mut b, 16).await.unwrap_err();
        assert_eq!(err, PeerError::FrameTooLarge(1000));

        let msg = PeerMessage::Logon {
            creds: Credentials::Peer(PeerCreds::new("node-a", "secret")),
        };
        let err = write_message(&mut a, &msg, 4).await.unwrap_err();
        assert!(matches!(err, PeerError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn test_tcp_link_exchange() {
        let transport = TcpTransport::new();
        let listener = transport.start_listener("127.0.0.1", 47911).await.unwrap();

        let mut client = transport.connect("127.0.0.1", 47911).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.tx.send(PeerMessage::Logoff).await.unwrap();
        assert_eq!(server.rx.recv().await, Some(PeerMessage::Logoff));

        server
            .tx
            .send(PeerMessage::InvokeResult {
                request_id: 1,
                result: Ok(nodemesh_proto::PeerReply::Ratified),
            })
            .await
            .unwrap();
        assert!(matches!(
            client.rx.recv().await,
            Some(PeerMessage::InvokeResult { request_id: 1, .. })
        ));

        // Dropping the client's sender closes the server's inbound side.
        drop(client);
        assert_eq!(server.rx.recv().await, None);

        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_offline() {
        let transport = TcpTransport::new();
        let err = transport.connect("127.0.0.1", 1).await.unwrap_err();
        assert!(err.is_offline() || err == PeerError::NetworkError);
    }
}
