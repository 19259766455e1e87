// # Peer connections
//
// This module provides the peer transport and the connection manager.
//
// A peer is one remote node. Inbound peers arrive through the websocket
// endpoint (the socket task lives in the API layer and feeds frames in);
// outbound peers are dialed with a websocket client. Both sides speak the
// same envelope protocol, one JSON envelope per text frame.
//
// The manager owns every peer for its lifetime and a single FIFO queue of
// inbound messages, consumed by the node manager's message router.

use crate::cluster::message::Message;
use crate::error::{NodeError, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WireFrame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Peer Transport
// ============================================================================

/// How a peer was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// We accepted the connection
    Passive,
    /// We dialed out
    Active,
}

/// Send half of an accepted websocket. The socket task owns the actual
/// stream; outbound frames travel through this sender until the peer
/// disconnects, after which `send` fails with `PeerGone`.
#[derive(Clone)]
pub struct IncomingChannel {
    frames: Arc<parking_lot::RwLock<Option<mpsc::UnboundedSender<String>>>>,
}

impl IncomingChannel {
    pub fn new(frames: mpsc::UnboundedSender<String>) -> Self {
        Self {
            frames: Arc::new(parking_lot::RwLock::new(Some(frames))),
        }
    }

    fn send_text(&self, text: String) -> Result<()> {
        match self.frames.read().as_ref() {
            Some(tx) => tx.send(text).map_err(|_| NodeError::PeerGone),
            None => Err(NodeError::PeerGone),
        }
    }

    /// Drop the frame sender. The socket task observes the closed channel,
    /// sends a close frame, and tears the connection down.
    pub fn disconnect(&self) {
        self.frames.write().take();
    }
}

/// A dialed websocket client, split so that send and receive do not block
/// each other. `receive` is driven directly by the caller during the join
/// handshake.
pub struct OutgoingChannel {
    sink: Mutex<SplitSink<WsStream, WireFrame>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl OutgoingChannel {
    pub fn new(ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(WireFrame::Text(text.into()))
            .await
            .map_err(|_| NodeError::PeerGone)
    }

    async fn receive(&self) -> Result<Message> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(WireFrame::Text(text))) => return Message::decode(text.as_str()),
                Some(Ok(WireFrame::Binary(_))) => {
                    return Err(NodeError::MalformedMessage("binary frame".into()))
                }
                Some(Ok(WireFrame::Ping(_)))
                | Some(Ok(WireFrame::Pong(_)))
                | Some(Ok(WireFrame::Frame(_))) => continue,
                Some(Ok(WireFrame::Close(_))) | None => return Err(NodeError::PeerGone),
                Some(Err(_)) => return Err(NodeError::PeerGone),
            }
        }
    }
}

/// The two transport variants behind one send/receive contract.
pub enum PeerChannel {
    Incoming(IncomingChannel),
    Outgoing(OutgoingChannel),
}

/// One remote node. Owned by the connection manager; handlers borrow it to
/// reply.
pub struct Peer {
    endpoint: String,
    kind: PeerKind,
    channel: PeerChannel,
}

impl Peer {
    pub fn new(endpoint: String, kind: PeerKind, channel: PeerChannel) -> Self {
        Self {
            endpoint,
            kind,
            channel,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    /// Serialize the message and write it as a single text frame.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let text = msg.encode()?;
        match &self.channel {
            PeerChannel::Incoming(ch) => ch.send_text(text),
            PeerChannel::Outgoing(ch) => ch.send_text(text).await,
        }
    }

    /// Await one message. Only meaningful on dialed peers; frames from
    /// accepted peers are delivered through the manager queue.
    pub async fn receive(&self) -> Result<Message> {
        match &self.channel {
            PeerChannel::Outgoing(ch) => ch.receive().await,
            PeerChannel::Incoming(_) => Err(NodeError::Internal(
                "receive on an accepted peer; use the inbound queue".into(),
            )),
        }
    }

    /// Drop the connection. For accepted peers this ends the socket task;
    /// dialed peers are closed by dropping them from the registry.
    pub fn close(&self) {
        if let PeerChannel::Incoming(ch) = &self.channel {
            ch.disconnect();
        }
    }
}

// ============================================================================
// Connection Manager
// ============================================================================

pub struct ConnectionManager {
    started: AtomicBool,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    passive: RwLock<Vec<Arc<Peer>>>,
    active: RwLock<Vec<Arc<Peer>>>,
    queue_tx: mpsc::UnboundedSender<(Arc<Peer>, Message)>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<(Arc<Peer>, Message)>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            started: AtomicBool::new(false),
            peers: RwLock::new(HashMap::new()),
            passive: RwLock::new(Vec::new()),
            active: RwLock::new(Vec::new()),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
        }
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(NodeError::NotStarted)
        }
    }

    /// Add a peer to the registry and its kind-specific list. A duplicate
    /// endpoint replaces the prior record (last write wins); the old
    /// transport is assumed dead and dropped without a close.
    pub async fn register(
        &self,
        endpoint: &str,
        channel: PeerChannel,
        kind: PeerKind,
    ) -> Result<Arc<Peer>> {
        self.ensure_started()?;

        let peer = Arc::new(Peer::new(endpoint.to_string(), kind, channel));
        let prior = {
            let mut peers = self.peers.write().await;
            peers.insert(endpoint.to_string(), Arc::clone(&peer))
        };
        if let Some(prior) = &prior {
            tracing::debug!(endpoint, "replacing stale peer registration");
            self.passive
                .write()
                .await
                .retain(|p| !Arc::ptr_eq(p, prior));
            self.active.write().await.retain(|p| !Arc::ptr_eq(p, prior));
        }

        match kind {
            PeerKind::Passive => self.passive.write().await.push(Arc::clone(&peer)),
            PeerKind::Active => self.active.write().await.push(Arc::clone(&peer)),
        }
        Ok(peer)
    }

    /// Remove a peer on disconnect.
    pub async fn remove(&self, endpoint: &str) -> Option<Arc<Peer>> {
        let removed = self.peers.write().await.remove(endpoint);
        if let Some(peer) = &removed {
            self.passive
                .write()
                .await
                .retain(|p| !Arc::ptr_eq(p, peer));
            self.active.write().await.retain(|p| !Arc::ptr_eq(p, peer));
        }
        removed
    }

    pub async fn lookup(&self, endpoint: &str) -> Option<Arc<Peer>> {
        self.peers.read().await.get(endpoint).cloned()
    }

    /// Enqueue a message received from an accepted peer. Arrival order
    /// across all peers is preserved.
    pub fn enqueue_incoming(&self, peer: Arc<Peer>, msg: Message) -> Result<()> {
        self.ensure_started()?;
        self.queue_tx
            .send((peer, msg))
            .map_err(|_| NodeError::ShuttingDown)
    }

    /// Pop the next inbound message in FIFO order. Single consumer: the
    /// message router.
    pub async fn wait_incoming(&self) -> Result<(Arc<Peer>, Message)> {
        self.ensure_started()?;
        self.queue_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(NodeError::ShuttingDown)
    }

    /// Idempotent outbound dial. An endpoint that is already registered is
    /// returned as-is; otherwise a new websocket client is opened and
    /// registered as an active peer.
    pub async fn connect(&self, endpoint: &str) -> Result<Arc<Peer>> {
        self.ensure_started()?;

        if let Some(peer) = self.lookup(endpoint).await {
            return Ok(peer);
        }

        let (ws, _) = connect_async(endpoint)
            .await
            .map_err(|e| NodeError::DialFailed(format!("{}: {}", endpoint, e)))?;
        tracing::debug!(endpoint, "outbound peer connected");
        self.register(
            endpoint,
            PeerChannel::Outgoing(OutgoingChannel::new(ws)),
            PeerKind::Active,
        )
        .await
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn passive_count(&self) -> usize {
        self.passive.read().await.len()
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }
}
