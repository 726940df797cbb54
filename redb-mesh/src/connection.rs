//! Peer connection actor: one writer task draining an outgoing queue, one
//! reader task dispatching inbound frames, and a ping loop sampling RTT.
//! Connections are arena objects keyed by `peer_node_id`; everything else
//! holds ids and resolves them through the node at use time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use redb_types::log::{debug, warn};
use redb_types::models::{ConnectionInfo, ConnectionStatus, NodeInfo};
use redb_types::parking_lot::RwLock;
use redb_types::serde_json;
use tokio::sync::{mpsc, watch};

use crate::errors::MeshError;
use crate::protocol::{encode, MeshFrames, MeshMessage};

const OUTGOING_QUEUE: usize = 256;
const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Inbound dispatch target; the mesh node implements this.
#[async_trait]
pub(crate) trait InboundHandler: Send + Sync + 'static {
    async fn handle(&self, from: u64, message: MeshMessage);
    async fn disconnected(&self, peer_node_id: u64);
}

#[derive(Debug)]
pub struct PeerConnection {
    peer: NodeInfo,
    remote_addr: SocketAddr,
    status: RwLock<ConnectionStatus>,
    rtt_micros: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connected_at: DateTime<Utc>,
    outgoing: mpsc::Sender<MeshMessage>,
    shutdown: watch::Sender<bool>,
}

impl PeerConnection {
    /// Takes over an authenticated framed stream and spawns the io tasks.
    pub(crate) fn spawn(
        peer: NodeInfo,
        frames: MeshFrames,
        handler: Arc<dyn InboundHandler>,
    ) -> Arc<Self> {
        let remote_addr = frames
            .get_ref()
            .peer_addr()
            .unwrap_or_else(|_| peer.addr);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);
        let (shutdown_tx, _) = watch::channel(false);

        let connection = Arc::new(Self {
            peer,
            remote_addr,
            status: RwLock::new(ConnectionStatus::Connected),
            rtt_micros: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            connected_at: Utc::now(),
            outgoing: outgoing_tx,
            shutdown: shutdown_tx,
        });

        let (sink, stream) = frames.split();
        tokio::spawn(write_loop(
            connection.clone(),
            sink,
            outgoing_rx,
        ));
        tokio::spawn(read_loop(connection.clone(), stream, handler));
        tokio::spawn(ping_loop(connection.clone()));
        connection
    }

    pub fn peer(&self) -> &NodeInfo {
        &self.peer
    }

    pub fn peer_node_id(&self) -> u64 {
        self.peer.node_id
    }

    pub async fn send(&self, message: MeshMessage) -> Result<(), MeshError> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| MeshError::ConnectionClosed(self.peer.node_id))
    }

    /// Best-effort send that never blocks the caller; used for gossip.
    pub fn try_send(&self, message: MeshMessage) {
        if self.outgoing.try_send(message).is_err() {
            debug!(
                "outgoing queue to node {} is full or closed, dropping frame",
                self.peer.node_id
            );
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer_node_id: self.peer.node_id,
            remote_addr: self.remote_addr,
            status: *self.status.read(),
            rtt_micros: self.rtt_micros.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            tls: false,
            connected_at: Some(self.connected_at),
        }
    }

    pub fn is_open(&self) -> bool {
        *self.status.read() == ConnectionStatus::Connected
    }

    pub fn close(&self) {
        *self.status.write() = ConnectionStatus::Disconnecting;
        self.shutdown.send_replace(true);
    }

    fn mark_failed(&self) {
        let mut status = self.status.write();
        if *status == ConnectionStatus::Connected {
            *status = ConnectionStatus::Failed;
        }
    }
}

async fn write_loop(
    connection: Arc<PeerConnection>,
    mut sink: SplitSink<MeshFrames, bytes::Bytes>,
    mut outgoing: mpsc::Receiver<MeshMessage>,
) {
    let mut shutdown = connection.shutdown.subscribe();
    loop {
        tokio::select! {
            message = outgoing.recv() => {
                let Some(message) = message else { break };
                let frame = match encode(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("dropping unencodable frame: {e}");
                        continue;
                    }
                };
                let len = frame.len() as u64;
                if let Err(e) = sink.send(frame).await {
                    debug!("write to node {} failed: {e}", connection.peer_node_id());
                    connection.mark_failed();
                    break;
                }
                connection.bytes_sent.fetch_add(len, Ordering::Relaxed);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    connection: Arc<PeerConnection>,
    mut stream: SplitStream<MeshFrames>,
    handler: Arc<dyn InboundHandler>,
) {
    let mut shutdown = connection.shutdown.subscribe();
    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(bytes)) => {
                        connection
                            .bytes_received
                            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                        let message: MeshMessage = match serde_json::from_slice(&bytes) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!(
                                    "malformed frame from node {}: {e}",
                                    connection.peer_node_id()
                                );
                                continue;
                            }
                        };
                        match message {
                            MeshMessage::Ping { nonce, sent_micros } => {
                                connection.try_send(MeshMessage::Pong { nonce, sent_micros });
                            }
                            MeshMessage::Pong { sent_micros, .. } => {
                                let now = Utc::now().timestamp_micros() as u64;
                                connection
                                    .rtt_micros
                                    .store(now.saturating_sub(sent_micros), Ordering::Relaxed);
                            }
                            message => {
                                handler.handle(connection.peer_node_id(), message).await;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!("read from node {} failed: {e}", connection.peer_node_id());
                        connection.mark_failed();
                        break;
                    }
                    None => {
                        connection.mark_failed();
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    handler.disconnected(connection.peer_node_id()).await;
}

async fn ping_loop(connection: Arc<PeerConnection>) {
    let mut shutdown = connection.shutdown.subscribe();
    let mut timer = tokio::time::interval(PING_INTERVAL);
    let mut nonce = 0u64;
    loop {
        tokio::select! {
            _ = timer.tick() => {
                nonce += 1;
                connection.try_send(MeshMessage::Ping {
                    nonce,
                    sent_micros: Utc::now().timestamp_micros() as u64,
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
