//! Network adapter: turns transport connections into peer events.
//!
//! Per-connection state machine:
//! ```text
//!  Connecting ──► Awaiting-Join ──join + common version──► Established ──► Closed
//!                      │                                        │
//!                      ├─ timeout / malformed / no version ─────┴──► Closed
//! ```
//!
//! Every connection runs in its own task, so a slow handshake or a stalled
//! peer never blocks the others. Events for one connection are emitted in
//! receipt order on a single channel:
//!
//! - [`NetworkEvent::PeerCandidate`] once the handshake completes,
//! - [`NetworkEvent::Message`] for every payload frame (not interpreted here),
//! - [`NetworkEvent::PeerDisconnected`] when a registered peer goes away.
//!
//! Outbound frames go through a bounded per-peer queue drained by the
//! connection task; [`NetworkAdapter::send`] never waits on a socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::protocol::{
    select_protocol_version, Message, MessageKind, PeerId, PeerMetadata, ProtocolError,
    ProtocolVersion,
};
use crate::transport::{dial_websocket, Transport, TransportError};

/// Sent to a peer whose offered versions share nothing with ours.
pub const UNSUPPORTED_VERSION: &str = "unsupported protocol version";

/// Network adapter configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Our identity in `peer` / `join` messages.
    pub peer_id: PeerId,
    pub peer_metadata: PeerMetadata,
    /// Ascending preference order.
    pub supported_protocol_versions: Vec<ProtocolVersion>,
    /// Time allowed for the remote side's `join` (or `peer` reply).
    pub handshake_timeout: Duration,
    /// Outbound frames buffered per peer before `send` reports backpressure.
    pub outbound_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            peer_id: PeerId::generate(),
            peer_metadata: PeerMetadata::default(),
            supported_protocol_versions: vec![ProtocolVersion::current()],
            handshake_timeout: Duration::from_secs(10),
            outbound_capacity: 1024,
        }
    }
}

impl NetworkConfig {
    pub fn for_testing(peer_id: impl Into<PeerId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            handshake_timeout: Duration::from_millis(500),
            outbound_capacity: 256,
            ..Self::default()
        }
    }
}

/// Events surfaced to the repository.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    PeerCandidate {
        peer_id: PeerId,
        peer_metadata: PeerMetadata,
    },
    Message(Message),
    PeerDisconnected {
        peer_id: PeerId,
    },
}

/// Network errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NetworkError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("rejected by remote peer: {0}")]
    Rejected(String),
    #[error("{0} messages have no target and cannot be sent")]
    NoTarget(MessageKind),
    #[error("outbound queue for peer {0} is full")]
    QueueFull(PeerId),
    #[error("connection to peer {0} is closed")]
    Closed(PeerId),
}

enum Outbound {
    Frame(Vec<u8>),
    /// Say `leave` and close.
    Close,
}

struct PeerConnection {
    connection_id: u64,
    outbound: mpsc::Sender<Outbound>,
    protocol_version: ProtocolVersion,
}

struct Inner {
    config: NetworkConfig,
    peers: RwLock<HashMap<PeerId, PeerConnection>>,
    events: mpsc::UnboundedSender<NetworkEvent>,
    next_connection: AtomicU64,
}

/// Cheaply cloneable handle to one adapter.
#[derive(Clone)]
pub struct NetworkAdapter {
    inner: Arc<Inner>,
}

impl NetworkAdapter {
    /// Create an adapter and the receiver for its events.
    pub fn new(config: NetworkConfig) -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let adapter = Self {
            inner: Arc::new(Inner {
                config,
                peers: RwLock::new(HashMap::new()),
                events,
                next_connection: AtomicU64::new(1),
            }),
        };
        (adapter, rx)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.config.peer_id
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    /// Currently registered peers.
    pub async fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.read().await.keys().cloned().collect()
    }

    /// Version negotiated with `peer`, if connected.
    pub async fn protocol_version(&self, peer: &PeerId) -> Option<ProtocolVersion> {
        self.inner
            .peers
            .read()
            .await
            .get(peer)
            .map(|c| c.protocol_version.clone())
    }

    // ─── Connection setup ─────────────────────────────────────────────

    /// Serve an inbound connection: await `join`, answer `peer`, then relay.
    pub fn accept<T: Transport>(&self, transport: T) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut transport = transport;
            match inner.accept_handshake(&mut transport).await {
                Ok((peer_id, metadata, version)) => {
                    inner.establish(transport, peer_id, metadata, version).await;
                }
                Err(e) => {
                    log::warn!("Handshake failed: {e}");
                    transport.close().await;
                }
            }
        })
    }

    /// Open an outbound connection: send `join`, await `peer`, then relay in
    /// the background. Returns the remote peer id.
    pub async fn connect<T: Transport>(&self, transport: T) -> Result<PeerId, NetworkError> {
        let mut transport = transport;
        match self.inner.connect_handshake(&mut transport).await {
            Ok((peer_id, metadata, version)) => {
                let inner = Arc::clone(&self.inner);
                let remote = peer_id.clone();
                let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
                tokio::spawn(async move {
                    inner
                        .establish_then(transport, peer_id, metadata, version, ready_tx)
                        .await;
                });
                // Registered before we return, so `send` to the peer works immediately.
                let _ = ready_rx.await;
                Ok(remote)
            }
            Err(e) => {
                transport.close().await;
                Err(e)
            }
        }
    }

    /// Dial a WebSocket URL and run the client handshake.
    pub async fn connect_websocket(&self, url: &str) -> Result<PeerId, NetworkError> {
        let transport = dial_websocket(url).await?;
        self.connect(transport).await
    }

    // ─── Outbound ─────────────────────────────────────────────────────

    /// Queue a message for its target peer.
    ///
    /// Empty payloads are rejected. Messages for peers that are not
    /// connected are logged and dropped.
    pub async fn send(&self, message: Message) -> Result<(), NetworkError> {
        message.validate()?;
        let kind = message.kind();
        let target = message
            .target_id()
            .cloned()
            .ok_or(NetworkError::NoTarget(kind))?;
        let frame = message.encode()?;

        let peers = self.inner.peers.read().await;
        let Some(conn) = peers.get(&target) else {
            log::debug!("Dropping {kind} for unconnected peer {target}");
            return Ok(());
        };
        conn.outbound
            .try_send(Outbound::Frame(frame))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => NetworkError::QueueFull(target.clone()),
                mpsc::error::TrySendError::Closed(_) => NetworkError::Closed(target.clone()),
            })
    }

    /// Say `leave` to `peer` and close its connection.
    pub async fn disconnect(&self, peer: &PeerId) {
        let removed = self.inner.peers.write().await.remove(peer);
        if let Some(conn) = removed {
            // A full queue still ends the task once the sender is dropped.
            let _ = conn.outbound.try_send(Outbound::Close);
            log::info!("Disconnected peer {peer}");
            self.inner.emit(NetworkEvent::PeerDisconnected {
                peer_id: peer.clone(),
            });
        }
    }

    /// Disconnect every peer.
    pub async fn close_all(&self) {
        for peer in self.peers().await {
            self.disconnect(&peer).await;
        }
    }
}

enum Step {
    Incoming(Option<Result<Vec<u8>, TransportError>>),
    Outgoing(Option<Outbound>),
}

impl Inner {
    fn emit(&self, event: NetworkEvent) {
        if self.events.send(event).is_err() {
            log::trace!("Network event dropped: receiver gone");
        }
    }

    async fn send_error<T: Transport>(&self, transport: &mut T, target: PeerId, text: &str) {
        let msg = Message::error(self.config.peer_id.clone(), target, text);
        match msg.encode() {
            Ok(frame) => {
                if let Err(e) = transport.send(frame).await {
                    log::debug!("Could not deliver error frame: {e}");
                }
            }
            Err(e) => log::error!("Failed to encode error frame: {e}"),
        }
    }

    async fn recv_handshake<T: Transport>(&self, transport: &mut T) -> Result<Vec<u8>, NetworkError> {
        let timeout = self.config.handshake_timeout;
        match tokio::time::timeout(timeout, transport.recv()).await {
            Err(_) => Err(NetworkError::HandshakeTimeout(timeout)),
            Ok(None) => Err(TransportError::Closed.into()),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(Some(Ok(frame))) => Ok(frame),
        }
    }

    /// Server side: `join` in, `peer` (or `error`) out.
    async fn accept_handshake<T: Transport>(
        &self,
        transport: &mut T,
    ) -> Result<(PeerId, PeerMetadata, ProtocolVersion), NetworkError> {
        let frame = self.recv_handshake(transport).await?;
        let msg = match Message::decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                self.send_error(transport, PeerId::new(""), "malformed frame").await;
                return Err(e.into());
            }
        };

        let Message::Join {
            sender_id,
            peer_metadata,
            supported_protocol_versions,
        } = msg
        else {
            let got = msg.kind();
            self.send_error(transport, msg.sender_id().clone(), "expected join").await;
            return Err(ProtocolError::Unexpected {
                expected: MessageKind::Join,
                got,
            }
            .into());
        };

        let Some(version) = select_protocol_version(
            &self.config.supported_protocol_versions,
            &supported_protocol_versions,
        ) else {
            log::warn!(
                "Peer {sender_id} offered {:?}, none supported",
                supported_protocol_versions
            );
            self.send_error(transport, sender_id, UNSUPPORTED_VERSION).await;
            return Err(ProtocolError::UnsupportedVersion.into());
        };

        let reply = Message::Peer {
            sender_id: self.config.peer_id.clone(),
            peer_metadata: self.config.peer_metadata.clone(),
            selected_protocol_version: version.clone(),
            target_id: sender_id.clone(),
        };
        transport.send(reply.encode()?).await?;
        Ok((sender_id, peer_metadata, version))
    }

    /// Client side: `join` out, `peer` (or `error`) in.
    async fn connect_handshake<T: Transport>(
        &self,
        transport: &mut T,
    ) -> Result<(PeerId, PeerMetadata, ProtocolVersion), NetworkError> {
        let join = Message::join(
            self.config.peer_id.clone(),
            self.config.peer_metadata.clone(),
            self.config.supported_protocol_versions.clone(),
        );
        transport.send(join.encode()?).await?;

        let frame = self.recv_handshake(transport).await?;
        match Message::decode(&frame)? {
            Message::Peer {
                sender_id,
                peer_metadata,
                selected_protocol_version,
                ..
            } => {
                if !self
                    .config
                    .supported_protocol_versions
                    .contains(&selected_protocol_version)
                {
                    self.send_error(transport, sender_id, UNSUPPORTED_VERSION).await;
                    return Err(ProtocolError::UnsupportedVersion.into());
                }
                Ok((sender_id, peer_metadata, selected_protocol_version))
            }
            Message::Error { message, .. } => Err(NetworkError::Rejected(message)),
            other => Err(ProtocolError::Unexpected {
                expected: MessageKind::Peer,
                got: other.kind(),
            }
            .into()),
        }
    }

    async fn establish<T: Transport>(
        self: Arc<Self>,
        transport: T,
        peer_id: PeerId,
        metadata: PeerMetadata,
        version: ProtocolVersion,
    ) {
        let (ready_tx, _) = tokio::sync::oneshot::channel();
        self.establish_then(transport, peer_id, metadata, version, ready_tx)
            .await;
    }

    /// Register the peer, announce it, signal `ready`, then relay until close.
    async fn establish_then<T: Transport>(
        self: Arc<Self>,
        mut transport: T,
        peer_id: PeerId,
        peer_metadata: PeerMetadata,
        version: ProtocolVersion,
        ready: tokio::sync::oneshot::Sender<()>,
    ) {
        let (outbound, mut rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);

        let previous = self.peers.write().await.insert(
            peer_id.clone(),
            PeerConnection {
                connection_id,
                outbound,
                protocol_version: version.clone(),
            },
        );
        if let Some(old) = previous {
            // Dropping the old sender ends the old connection's task.
            drop(old);
            log::info!("Peer {peer_id} reconnected, replacing previous connection");
        }
        log::info!("Peer {peer_id} established (protocol {version})");
        self.emit(NetworkEvent::PeerCandidate {
            peer_id: peer_id.clone(),
            peer_metadata,
        });
        let _ = ready.send(());

        loop {
            let step = tokio::select! {
                incoming = transport.recv() => Step::Incoming(incoming),
                outgoing = rx.recv() => Step::Outgoing(outgoing),
            };

            match step {
                Step::Incoming(None) => {
                    log::debug!("Peer {peer_id} transport closed");
                    break;
                }
                Step::Incoming(Some(Err(e))) => {
                    log::warn!("Peer {peer_id} transport error: {e}");
                    break;
                }
                Step::Incoming(Some(Ok(frame))) => {
                    if !self.handle_frame(&mut transport, &peer_id, &frame).await {
                        break;
                    }
                }
                Step::Outgoing(Some(Outbound::Frame(frame))) => {
                    if let Err(e) = transport.send(frame).await {
                        log::warn!("Send to peer {peer_id} failed: {e}");
                        break;
                    }
                }
                Step::Outgoing(Some(Outbound::Close)) => {
                    if let Ok(frame) = Message::leave(self.config.peer_id.clone()).encode() {
                        let _ = transport.send(frame).await;
                    }
                    break;
                }
                Step::Outgoing(None) => break,
            }
        }

        transport.close().await;

        let mut peers = self.peers.write().await;
        let current = peers.get(&peer_id).map(|c| c.connection_id) == Some(connection_id);
        if current {
            peers.remove(&peer_id);
            drop(peers);
            log::info!("Peer {peer_id} disconnected");
            self.emit(NetworkEvent::PeerDisconnected { peer_id });
        }
    }

    /// Handle one frame from an established peer. `false` ends the association.
    async fn handle_frame<T: Transport>(
        &self,
        transport: &mut T,
        peer_id: &PeerId,
        frame: &[u8],
    ) -> bool {
        let msg = match Message::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Malformed frame from peer {peer_id}: {e}");
                self.send_error(transport, peer_id.clone(), "malformed frame").await;
                return false;
            }
        };

        if let Message::Leave { sender_id } = &msg {
            if sender_id == peer_id {
                log::debug!("Peer {peer_id} left");
                return false;
            }
            log::debug!("Ignoring leave for unknown peer {sender_id}");
            return true;
        }

        if msg.sender_id() != peer_id {
            log::warn!(
                "Peer {peer_id} sent {} as {}",
                msg.kind(),
                msg.sender_id()
            );
            self.send_error(transport, peer_id.clone(), "sender id mismatch").await;
            return false;
        }

        match msg.kind() {
            MessageKind::Error => {
                if let Message::Error { message, .. } = &msg {
                    log::warn!("Peer {peer_id} reported error: {message}");
                }
                self.emit(NetworkEvent::Message(msg));
                true
            }
            MessageKind::Join | MessageKind::Peer => {
                self.send_error(transport, peer_id.clone(), "unexpected handshake message")
                    .await;
                false
            }
            _ => {
                if let Err(e) = msg.validate() {
                    log::warn!("Invalid frame from peer {peer_id}: {e}");
                    self.send_error(transport, peer_id.clone(), &e.to_string()).await;
                    return false;
                }
                self.emit(NetworkEvent::Message(msg));
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DocumentId;
    use crate::transport::ChannelTransport;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<NetworkEvent>) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn recv_msg(transport: &mut ChannelTransport) -> Option<Message> {
        let frame = tokio::time::timeout(Duration::from_secs(2), transport.recv())
            .await
            .expect("timed out waiting for frame")?
            .ok()?;
        Some(Message::decode(&frame).unwrap())
    }

    fn join(peer: &str, versions: &[&str]) -> Vec<u8> {
        Message::join(
            PeerId::new(peer),
            PeerMetadata::default(),
            versions.iter().map(|v| ProtocolVersion::new(*v)).collect(),
        )
        .encode()
        .unwrap()
    }

    fn server_with_versions(versions: &[&str]) -> (NetworkAdapter, mpsc::UnboundedReceiver<NetworkEvent>) {
        let mut config = NetworkConfig::for_testing("server");
        config.supported_protocol_versions =
            versions.iter().map(|v| ProtocolVersion::new(*v)).collect();
        NetworkAdapter::new(config)
    }

    #[tokio::test]
    async fn test_handshake_selects_common_version() {
        let (server, mut events) = server_with_versions(&["2", "3"]);
        let (local, mut remote) = ChannelTransport::pair();
        server.accept(local);

        remote.send(join("client", &["1", "2"])).await.unwrap();
        match recv_msg(&mut remote).await.unwrap() {
            Message::Peer {
                selected_protocol_version,
                target_id,
                ..
            } => {
                assert_eq!(selected_protocol_version, ProtocolVersion::new("2"));
                assert_eq!(target_id, PeerId::new("client"));
            }
            other => panic!("expected peer, got {other:?}"),
        }

        assert_eq!(
            next_event(&mut events).await,
            NetworkEvent::PeerCandidate {
                peer_id: PeerId::new("client"),
                peer_metadata: PeerMetadata::default(),
            }
        );
        assert_eq!(
            server.protocol_version(&PeerId::new("client")).await,
            Some(ProtocolVersion::new("2"))
        );
    }

    #[tokio::test]
    async fn test_disjoint_versions_get_error_and_no_candidate() {
        let (server, mut events) = server_with_versions(&["2", "3"]);
        let (local, mut remote) = ChannelTransport::pair();
        let task = server.accept(local);

        remote.send(join("client", &["1"])).await.unwrap();
        match recv_msg(&mut remote).await.unwrap() {
            Message::Error { message, .. } => assert_eq!(message, UNSUPPORTED_VERSION),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(recv_msg(&mut remote).await.is_none());

        task.await.unwrap();
        assert!(events.try_recv().is_err());
        assert!(server.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_timeout_closes_connection() {
        let (server, mut events) = server_with_versions(&["1"]);
        let (local, mut remote) = ChannelTransport::pair();
        let task = server.accept(local);

        assert!(recv_msg(&mut remote).await.is_none());
        task.await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_non_join_first_frame_is_rejected() {
        let (server, _events) = server_with_versions(&["1"]);
        let (local, mut remote) = ChannelTransport::pair();
        server.accept(local);

        let sync = Message::sync("client".into(), "server".into(), "d".into(), vec![1]);
        remote.send(sync.encode().unwrap()).await.unwrap();
        assert!(matches!(recv_msg(&mut remote).await, Some(Message::Error { .. })));
    }

    #[tokio::test]
    async fn test_payload_forwarded_and_leave_disconnects() {
        let (server, mut events) = server_with_versions(&["1"]);
        let (local, mut remote) = ChannelTransport::pair();
        server.accept(local);

        remote.send(join("client", &["1"])).await.unwrap();
        recv_msg(&mut remote).await.unwrap();
        next_event(&mut events).await;

        let sync = Message::sync("client".into(), "server".into(), "doc".into(), vec![1, 2]);
        remote.send(sync.encode().unwrap()).await.unwrap();
        assert_eq!(next_event(&mut events).await, NetworkEvent::Message(sync));

        // Leave for someone else is a no-op.
        remote
            .send(Message::leave("stranger".into()).encode().unwrap())
            .await
            .unwrap();
        remote
            .send(Message::leave("client".into()).encode().unwrap())
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut events).await,
            NetworkEvent::PeerDisconnected {
                peer_id: PeerId::new("client")
            }
        );
        assert!(server.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_error_from_peer_keeps_connection() {
        let (server, mut events) = server_with_versions(&["1"]);
        let (local, mut remote) = ChannelTransport::pair();
        server.accept(local);

        remote.send(join("client", &["1"])).await.unwrap();
        recv_msg(&mut remote).await.unwrap();
        next_event(&mut events).await;

        let error = Message::error("client".into(), "server".into(), "could not load doc");
        remote.send(error.encode().unwrap()).await.unwrap();
        assert_eq!(next_event(&mut events).await, NetworkEvent::Message(error));

        let sync = Message::sync("client".into(), "server".into(), "doc".into(), vec![3]);
        remote.send(sync.encode().unwrap()).await.unwrap();
        assert_eq!(next_event(&mut events).await, NetworkEvent::Message(sync));
        assert_eq!(server.peers().await, vec![PeerId::new("client")]);
    }

    #[tokio::test]
    async fn test_sender_mismatch_terminates() {
        let (server, mut events) = server_with_versions(&["1"]);
        let (local, mut remote) = ChannelTransport::pair();
        server.accept(local);

        remote.send(join("client", &["1"])).await.unwrap();
        recv_msg(&mut remote).await.unwrap();
        next_event(&mut events).await;

        let spoofed = Message::sync("other".into(), "server".into(), "doc".into(), vec![1]);
        remote.send(spoofed.encode().unwrap()).await.unwrap();
        assert!(matches!(recv_msg(&mut remote).await, Some(Message::Error { .. })));
        assert!(matches!(
            next_event(&mut events).await,
            NetworkEvent::PeerDisconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_send_rules() {
        let (server, _events) = server_with_versions(&["1"]);

        let empty = Message::sync("server".into(), "x".into(), DocumentId::new("d"), Vec::new());
        assert!(matches!(
            server.send(empty).await,
            Err(NetworkError::Protocol(ProtocolError::EmptyPayload(_)))
        ));

        let unknown = Message::sync("server".into(), "nobody".into(), DocumentId::new("d"), vec![1]);
        assert!(server.send(unknown).await.is_ok());

        let leave = Message::leave("server".into());
        assert!(matches!(
            server.send(leave).await,
            Err(NetworkError::NoTarget(MessageKind::Leave))
        ));
    }

    #[tokio::test]
    async fn test_client_connect_against_server() {
        let (server, mut server_events) = server_with_versions(&["1"]);
        let (client, mut client_events) = NetworkAdapter::new(NetworkConfig::for_testing("client"));
        let (a, b) = ChannelTransport::pair();
        server.accept(a);

        let remote = client.connect(b).await.unwrap();
        assert_eq!(remote, PeerId::new("server"));
        assert!(matches!(
            next_event(&mut client_events).await,
            NetworkEvent::PeerCandidate { .. }
        ));
        assert!(matches!(
            next_event(&mut server_events).await,
            NetworkEvent::PeerCandidate { .. }
        ));

        let msg = Message::sync("client".into(), "server".into(), "doc".into(), vec![5]);
        client.send(msg.clone()).await.unwrap();
        assert_eq!(next_event(&mut server_events).await, NetworkEvent::Message(msg));

        client.disconnect(&PeerId::new("server")).await;
        assert!(matches!(
            next_event(&mut server_events).await,
            NetworkEvent::PeerDisconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_client_rejected_on_version_mismatch() {
        let (server, _events) = server_with_versions(&["9"]);
        let (client, _client_events) = NetworkAdapter::new(NetworkConfig::for_testing("client"));
        let (a, b) = ChannelTransport::pair();
        server.accept(a);

        let err = client.connect(b).await.unwrap_err();
        assert_eq!(err, NetworkError::Rejected(UNSUPPORTED_VERSION.to_string()));
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_connection() {
        let (server, mut events) = server_with_versions(&["1"]);

        let (first_local, mut first) = ChannelTransport::pair();
        server.accept(first_local);
        first.send(join("client", &["1"])).await.unwrap();
        recv_msg(&mut first).await.unwrap();
        next_event(&mut events).await;

        let (second_local, mut second) = ChannelTransport::pair();
        server.accept(second_local);
        second.send(join("client", &["1"])).await.unwrap();
        recv_msg(&mut second).await.unwrap();
        next_event(&mut events).await;

        // The first connection is closed without a disconnect event.
        assert!(recv_msg(&mut first).await.is_none());
        assert_eq!(server.peers().await, vec![PeerId::new("client")]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }
}
