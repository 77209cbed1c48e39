//! P2P networking layer using async TCP with tokio.
//!
//! Each connection starts with a `Hello` exchange in both directions. A peer
//! is accepted only if the identity it announces is the one derived from the
//! public key it presents, and only once it has signed our per-connection
//! nonce with that key (`HelloAck`). The loop then admits or refuses the
//! peer; refused connections are closed before any frame is read from them.
//! Admitted peers get a writer task and a reader task that forward into the
//! central loop, which drops anything arriving from a peer it does not hold.
//!
//! Block lookups (`GetBlock`/`BlockResponse`) are correlated by request id
//! inside the loop, so callers get a plain request/response API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::block::{BlockData, BlockHash};
use crate::crypto::keys::{Identity, Signature, SigningKeypair, SigningPublicKey};
use crate::network::{self, Message, PeerId, Transport, TransportError, PROTOCOL_VERSION};

/// Maximum size of a handshake frame read from an unauthenticated connection.
const MAX_HANDSHAKE_MESSAGE_BYTES: usize = 64 * 1024;

// ── Public Types ──

/// Errors from P2P operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum P2pError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("invalid handshake")]
    InvalidHandshake,
    #[error("peer refused: {0}")]
    Refused(&'static str),
    #[error("shutdown")]
    Shutdown,
}

type BlockReply = oneshot::Sender<Result<BlockData, TransportError>>;

/// A command sent from the application to the P2P event loop.
pub enum P2pCommand {
    /// Connect to a peer at the given address.
    Connect(SocketAddr),
    /// Send a message to a specific peer.
    SendTo(PeerId, Message),
    /// Broadcast a message to all peers (optionally excluding one).
    Broadcast {
        message: Message,
        exclude: Option<PeerId>,
    },
    /// Ask `peer` for a block; the loop answers on `reply`.
    RequestBlock {
        peer: PeerId,
        hash: BlockHash,
        reply: BlockReply,
    },
    /// Request the current peer list.
    GetPeers(oneshot::Sender<Vec<PeerInfo>>),
    /// Shutdown the P2P system.
    Shutdown,
}

/// An event received from the P2P layer by the application.
#[derive(Debug)]
pub enum P2pEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    MessageReceived { from: PeerId, message: Box<Message> },
}

/// A connected peer, as reported to the application.
#[derive(Clone, Debug, Serialize)]
pub struct PeerInfo {
    pub identity: PeerId,
    pub address: String,
    pub outbound: bool,
}

/// Handle for the application to interact with the P2P layer.
#[derive(Clone)]
pub struct P2pHandle {
    command_tx: mpsc::Sender<P2pCommand>,
}

/// Configuration for the P2P layer.
#[derive(Clone)]
pub struct P2pConfig {
    pub listen_addr: SocketAddr,
    pub max_peers: usize,
    pub keypair: SigningKeypair,
}

struct PeerConnection {
    addr: SocketAddr,
    listen_port: u16,
    msg_tx: mpsc::Sender<Message>,
    is_outbound: bool,
}

/// Internal event from connection tasks to the main P2P loop.
enum InternalEvent {
    Connected {
        peer_id: PeerId,
        addr: SocketAddr,
        listen_port: u16,
        msg_tx: mpsc::Sender<Message>,
        is_outbound: bool,
        admitted: oneshot::Sender<bool>,
    },
    Message {
        from: PeerId,
        message: Box<Message>,
    },
    Disconnected(PeerId),
}

// ── P2pHandle ──

impl P2pHandle {
    /// Create a handle from a raw sender (for tests that never start a loop).
    pub fn from_sender(command_tx: mpsc::Sender<P2pCommand>) -> Self {
        P2pHandle { command_tx }
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<(), P2pError> {
        self.command_tx
            .send(P2pCommand::Connect(addr))
            .await
            .map_err(|_| P2pError::Shutdown)
    }

    pub async fn send_to(&self, peer_id: PeerId, msg: Message) -> Result<(), P2pError> {
        self.command_tx
            .send(P2pCommand::SendTo(peer_id, msg))
            .await
            .map_err(|_| P2pError::Shutdown)
    }

    /// Broadcast a message to all peers, optionally excluding one.
    pub async fn broadcast_except(
        &self,
        msg: Message,
        exclude: Option<PeerId>,
    ) -> Result<(), P2pError> {
        self.command_tx
            .send(P2pCommand::Broadcast {
                message: msg,
                exclude,
            })
            .await
            .map_err(|_| P2pError::Shutdown)
    }

    /// Ask `peer` for the block with `hash`, waiting at most
    /// `BLOCK_REQUEST_TIMEOUT_MS`.
    pub async fn fetch_block(
        &self,
        peer: PeerId,
        hash: BlockHash,
    ) -> Result<BlockData, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(P2pCommand::RequestBlock { peer, hash, reply })
            .await
            .map_err(|_| TransportError::Shutdown)?;
        let timeout =
            std::time::Duration::from_millis(crate::constants::BLOCK_REQUEST_TIMEOUT_MS);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Shutdown),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    pub async fn get_peers(&self) -> Result<Vec<PeerInfo>, P2pError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(P2pCommand::GetPeers(tx))
            .await
            .map_err(|_| P2pError::Shutdown)?;
        rx.await.map_err(|_| P2pError::Shutdown)
    }

    pub async fn shutdown(&self) -> Result<(), P2pError> {
        self.command_tx
            .send(P2pCommand::Shutdown)
            .await
            .map_err(|_| P2pError::Shutdown)
    }
}

#[async_trait]
impl Transport for P2pHandle {
    async fn broadcast(&self, message: Message) {
        if let Err(e) = self.broadcast_except(message, None).await {
            tracing::debug!(error = %e, "Broadcast dropped");
        }
    }

    async fn request_block(
        &self,
        peer: &PeerId,
        hash: BlockHash,
    ) -> Result<BlockData, TransportError> {
        self.fetch_block(peer.clone(), hash).await
    }
}

// ── Startup & Event Loop ──

/// Result of starting the P2P layer.
pub struct P2pStartResult {
    pub handle: P2pHandle,
    pub events: mpsc::Receiver<P2pEvent>,
    /// The actual bound address (useful when listening on port 0).
    pub local_addr: SocketAddr,
}

/// Bind the listener and spawn the P2P loop.
pub async fn start(config: P2pConfig) -> Result<P2pStartResult, P2pError> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| P2pError::ConnectionFailed(e.to_string()))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| P2pError::ConnectionFailed(e.to_string()))?;

    let (command_tx, command_rx) = mpsc::channel::<P2pCommand>(256);
    let (event_tx, event_rx) = mpsc::channel::<P2pEvent>(256);

    let local = Arc::new(LocalPeer {
        keypair: config.keypair.clone(),
        listen_port: local_addr.port(),
    });
    tokio::spawn(p2p_loop(config, local, listener, command_rx, event_tx));

    Ok(P2pStartResult {
        handle: P2pHandle { command_tx },
        events: event_rx,
        local_addr,
    })
}

async fn p2p_loop(
    config: P2pConfig,
    local: Arc<LocalPeer>,
    listener: TcpListener,
    mut command_rx: mpsc::Receiver<P2pCommand>,
    event_tx: mpsc::Sender<P2pEvent>,
) {
    let our_id = config.keypair.identity();
    let mut peers: HashMap<PeerId, PeerConnection> = HashMap::new();
    let mut pending: HashMap<u64, (PeerId, BlockHash, BlockReply)> = HashMap::new();
    let mut next_request_id: u64 = 0;
    let (internal_tx, mut internal_rx) = mpsc::channel::<InternalEvent>(256);

    loop {
        tokio::select! {
            result = listener.accept() => {
                if let Ok((stream, addr)) = result {
                    if peers.len() >= config.max_peers {
                        continue;
                    }
                    let local = Arc::clone(&local);
                    let internal_tx = internal_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, &local, internal_tx, false).await {
                            tracing::debug!(addr = %addr, error = %e, "Inbound connection failed");
                        }
                    });
                }
            }

            Some(cmd) = command_rx.recv() => {
                match cmd {
                    P2pCommand::Connect(addr) => {
                        if peers.len() >= config.max_peers {
                            continue;
                        }
                        let local = Arc::clone(&local);
                        let internal_tx = internal_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = connect_outbound(addr, &local, internal_tx).await {
                                tracing::debug!(addr = %addr, error = %e, "Outbound connection failed");
                            }
                        });
                    }
                    P2pCommand::SendTo(peer_id, msg) => {
                        if let Some(peer) = peers.get(&peer_id) {
                            if let Err(e) = peer.msg_tx.try_send(msg) {
                                tracing::debug!(peer = %peer_id.short(), error = %e, "Failed to send message to peer");
                            }
                        }
                    }
                    P2pCommand::Broadcast { message, exclude } => {
                        for (id, peer) in &peers {
                            if exclude.as_ref() == Some(id) {
                                continue;
                            }
                            if let Err(e) = peer.msg_tx.try_send(message.clone()) {
                                tracing::debug!(peer = %id.short(), error = %e, "Failed to broadcast to peer");
                            }
                        }
                    }
                    P2pCommand::RequestBlock { peer, hash, reply } => {
                        pending.retain(|_, (_, _, r)| !r.is_closed());
                        let Some(conn) = peers.get(&peer) else {
                            let _ = reply.send(Err(TransportError::UnknownPeer(peer)));
                            continue;
                        };
                        let request_id = next_request_id;
                        next_request_id = next_request_id.wrapping_add(1);
                        if conn.msg_tx.try_send(Message::GetBlock { request_id, hash }).is_err() {
                            let _ = reply.send(Err(TransportError::UnknownPeer(peer)));
                            continue;
                        }
                        pending.insert(request_id, (peer, hash, reply));
                    }
                    P2pCommand::GetPeers(reply) => {
                        let infos = peers
                            .iter()
                            .map(|(id, p)| PeerInfo {
                                identity: id.clone(),
                                address: SocketAddr::new(p.addr.ip(), p.listen_port).to_string(),
                                outbound: p.is_outbound,
                            })
                            .collect();
                        let _ = reply.send(infos);
                    }
                    P2pCommand::Shutdown => break,
                }
            }

            Some(event) = internal_rx.recv() => {
                match event {
                    InternalEvent::Connected { peer_id, addr, listen_port, msg_tx, is_outbound, admitted } => {
                        let refusal = if peer_id == our_id {
                            Some("self-connection")
                        } else if peers.contains_key(&peer_id) {
                            Some("already connected")
                        } else if peers.len() >= config.max_peers {
                            Some("peer table full")
                        } else {
                            None
                        };
                        if let Some(reason) = refusal {
                            tracing::debug!(peer = %peer_id.short(), addr = %addr, reason, "Refused peer");
                            let _ = admitted.send(false);
                            continue;
                        }
                        if admitted.send(true).is_err() {
                            continue;
                        }
                        tracing::info!(peer = %peer_id.short(), addr = %addr, outbound = is_outbound, "Peer connected");
                        peers.insert(peer_id.clone(), PeerConnection { addr, listen_port, msg_tx, is_outbound });
                        let _ = event_tx.send(P2pEvent::PeerConnected(peer_id)).await;
                    }
                    InternalEvent::Message { from, .. } if !peers.contains_key(&from) => {
                        tracing::debug!(peer = %from.short(), "Dropped message from unknown peer");
                    }
                    InternalEvent::Message { from, message } => match *message {
                        Message::BlockResponse { request_id, block } => {
                            match pending.remove(&request_id) {
                                Some((peer, hash, reply)) if peer == from => {
                                    let result = match block {
                                        Some(b) => Ok(*b),
                                        None => Err(TransportError::BlockNotFound(hash)),
                                    };
                                    let _ = reply.send(result);
                                }
                                Some(entry) => {
                                    // Answer from the wrong peer; keep waiting for the right one.
                                    pending.insert(request_id, entry);
                                }
                                None => {}
                            }
                        }
                        other => {
                            let message = Box::new(other);
                            let _ = event_tx.send(P2pEvent::MessageReceived { from, message }).await;
                        }
                    },
                    InternalEvent::Disconnected(peer_id) => {
                        if peers.remove(&peer_id).is_some() {
                            let orphaned: Vec<u64> = pending
                                .iter()
                                .filter(|(_, (p, _, _))| *p == peer_id)
                                .map(|(id, _)| *id)
                                .collect();
                            for id in orphaned {
                                if let Some((_, _, reply)) = pending.remove(&id) {
                                    let _ = reply.send(Err(TransportError::UnknownPeer(peer_id.clone())));
                                }
                            }
                            let _ = event_tx.send(P2pEvent::PeerDisconnected(peer_id)).await;
                        }
                    }
                }
            }
        }
    }
    tracing::info!("P2P loop stopped");
}

// ── Connection Handling ──

/// What this node presents during handshakes.
struct LocalPeer {
    keypair: SigningKeypair,
    listen_port: u16,
}

async fn connect_outbound(
    addr: SocketAddr,
    local: &LocalPeer,
    internal_tx: mpsc::Sender<InternalEvent>,
) -> Result<(), P2pError> {
    let timeout = std::time::Duration::from_millis(crate::constants::PEER_CONNECT_TIMEOUT_MS);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| P2pError::ConnectionFailed("timeout".into()))?
        .map_err(|e| P2pError::ConnectionFailed(e.to_string()))?;
    handle_connection(stream, addr, local, internal_tx, true).await
}

/// Run the handshake, ask the loop to admit the peer, then spawn the reader
/// and writer tasks. A refused connection is dropped here, which closes it.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    local: &LocalPeer,
    internal_tx: mpsc::Sender<InternalEvent>,
    is_outbound: bool,
) -> Result<(), P2pError> {
    let (mut reader, mut writer) = stream.into_split();
    let timeout = std::time::Duration::from_millis(crate::constants::PEER_CONNECT_TIMEOUT_MS);
    let (peer_id, listen_port) = tokio::time::timeout(
        timeout,
        handshake(&mut reader, &mut writer, local),
    )
    .await
    .map_err(|_| P2pError::ConnectionFailed("handshake timeout".into()))??;

    let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(128);
    let (admitted_tx, admitted_rx) = oneshot::channel();
    internal_tx
        .send(InternalEvent::Connected {
            peer_id: peer_id.clone(),
            addr,
            listen_port,
            msg_tx,
            is_outbound,
            admitted: admitted_tx,
        })
        .await
        .map_err(|_| P2pError::Shutdown)?;
    match admitted_rx.await {
        Ok(true) => {}
        Ok(false) => return Err(P2pError::Refused("not admitted")),
        Err(_) => return Err(P2pError::Shutdown),
    }

    let read_tx = internal_tx.clone();
    let read_peer = peer_id.clone();
    tokio::spawn(async move {
        loop {
            match read_message(&mut reader, crate::constants::MAX_NETWORK_MESSAGE_BYTES).await {
                Ok(message) => {
                    let event = InternalEvent::Message {
                        from: read_peer.clone(),
                        message: Box::new(message),
                    };
                    if read_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %read_peer.short(), error = %e, "Peer read failed");
                    let _ = read_tx.send(InternalEvent::Disconnected(read_peer)).await;
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            if write_message(&mut writer, &msg).await.is_err() {
                let _ = internal_tx.send(InternalEvent::Disconnected(peer_id)).await;
                break;
            }
        }
    });

    Ok(())
}

/// Exchange `Hello`s, then prove key possession to each other by signing
/// the other side's nonce. Returns the verified peer identity and the port
/// it listens on.
async fn handshake(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    local: &LocalPeer,
) -> Result<(PeerId, u16), P2pError> {
    let our_id = local.keypair.identity();
    let our_nonce: [u8; 32] = rand::random();
    let hello = Message::Hello {
        version: PROTOCOL_VERSION,
        identity: our_id.clone(),
        public_key: local.keypair.public.clone(),
        listen_port: local.listen_port,
        nonce: our_nonce,
    };
    write_message(writer, &hello).await?;

    let (peer_id, public_key, listen_port, their_nonce) =
        match read_message(reader, MAX_HANDSHAKE_MESSAGE_BYTES).await? {
            Message::Hello {
                version,
                identity,
                public_key,
                listen_port,
                nonce,
            } => {
                check_hello(version, &identity, &public_key)?;
                (identity, public_key, listen_port, nonce)
            }
            _ => return Err(P2pError::InvalidHandshake),
        };

    let signature = local
        .keypair
        .sign(&handshake_digest(&their_nonce, &our_id));
    write_message(writer, &Message::HelloAck { signature }).await?;

    match read_message(reader, MAX_HANDSHAKE_MESSAGE_BYTES).await? {
        Message::HelloAck { signature } => {
            check_ack(&public_key, &our_nonce, &peer_id, &signature)?;
        }
        _ => return Err(P2pError::InvalidHandshake),
    }
    Ok((peer_id, listen_port))
}

fn check_hello(
    version: u32,
    identity: &Identity,
    public_key: &SigningPublicKey,
) -> Result<(), P2pError> {
    if version != PROTOCOL_VERSION {
        return Err(P2pError::InvalidHandshake);
    }
    if !public_key.is_valid_size() || Identity::from_public_key(public_key) != *identity {
        return Err(P2pError::InvalidHandshake);
    }
    Ok(())
}

/// What a peer signs to prove it holds the key behind `signer`.
fn handshake_digest(nonce: &[u8; 32], signer: &Identity) -> crate::Hash {
    let mut data = Vec::with_capacity(32 + signer.as_str().len());
    data.extend_from_slice(nonce);
    data.extend_from_slice(signer.as_str().as_bytes());
    crate::hash_domain("slotchain.p2p.handshake", &data)
}

fn check_ack(
    public_key: &SigningPublicKey,
    our_nonce: &[u8; 32],
    signer: &Identity,
    signature: &Signature,
) -> Result<(), P2pError> {
    if public_key.verify(&handshake_digest(our_nonce, signer), signature) {
        Ok(())
    } else {
        Err(P2pError::InvalidHandshake)
    }
}

// ── Framed I/O ──

async fn read_message(stream: &mut OwnedReadHalf, max_len: usize) -> Result<Message, P2pError> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| P2pError::ConnectionFailed(e.to_string()))?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_len {
        return Err(P2pError::ConnectionFailed("message too large".into()));
    }
    let mut frame = vec![0u8; 4 + len];
    frame[..4].copy_from_slice(&len_buf);
    stream
        .read_exact(&mut frame[4..])
        .await
        .map_err(|e| P2pError::ConnectionFailed(e.to_string()))?;
    network::decode_message(&frame).ok_or_else(|| P2pError::ConnectionFailed("decode failed".into()))
}

async fn write_message(stream: &mut OwnedWriteHalf, msg: &Message) -> Result<(), P2pError> {
    let bytes = network::encode_message(msg).map_err(|e| P2pError::SendFailed(e.to_string()))?;
    stream
        .write_all(&bytes)
        .await
        .map_err(|e| P2pError::SendFailed(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| P2pError::SendFailed(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> P2pConfig {
        P2pConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_peers: crate::constants::MAX_PEERS,
            keypair: SigningKeypair::generate(),
        }
    }

    async fn next_connected(events: &mut mpsc::Receiver<P2pEvent>) -> PeerId {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event within timeout")
                .expect("event channel open");
            if let P2pEvent::PeerConnected(id) = event {
                return id;
            }
        }
    }

    #[tokio::test]
    async fn peers_learn_each_others_identity() {
        let config1 = test_config();
        let id1 = config1.keypair.identity();
        let node1 = start(config1).await.unwrap();
        let config2 = test_config();
        let id2 = config2.keypair.identity();
        let mut node2 = start(config2).await.unwrap();
        let mut events1 = node1.events;

        node2.handle.connect(node1.local_addr).await.unwrap();
        assert_eq!(next_connected(&mut events1).await, id2);
        assert_eq!(next_connected(&mut node2.events).await, id1);

        let peers = node1.handle.get_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].identity, id2);
        assert!(!peers[0].outbound);

        let _ = node1.handle.shutdown().await;
        let _ = node2.handle.shutdown().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_peer() {
        let node1 = start(test_config()).await.unwrap();
        let mut node2 = start(test_config()).await.unwrap();
        let mut events1 = node1.events;
        node2.handle.connect(node1.local_addr).await.unwrap();
        next_connected(&mut events1).await;
        next_connected(&mut node2.events).await;

        let kp = SigningKeypair::generate();
        let other = SigningKeypair::generate();
        let vote = crate::vote::Vote::new(&kp, other.identity(), 1);
        Transport::broadcast(&node2.handle, Message::NewVote(vote.clone())).await;

        let event = tokio::time::timeout(Duration::from_secs(5), events1.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            P2pEvent::MessageReceived { message, .. } => match *message {
                Message::NewVote(received) => assert_eq!(received, vote),
                other => panic!("unexpected message {:?}", other),
            },
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn block_request_is_answered() {
        let node1 = start(test_config()).await.unwrap();
        let config2 = test_config();
        let id2 = config2.keypair.identity();
        let node2 = start(config2).await.unwrap();
        let mut events1 = node1.events;
        let mut events2 = node2.events;
        node1.handle.connect(node2.local_addr).await.unwrap();
        next_connected(&mut events1).await;
        next_connected(&mut events2).await;

        // Node 2 serves genesis and nothing else.
        let responder = node2.handle.clone();
        tokio::spawn(async move {
            while let Some(event) = events2.recv().await {
                if let P2pEvent::MessageReceived { from, message } = event {
                    if let Message::GetBlock { request_id, hash } = *message {
                        let genesis = BlockData::genesis();
                        let block = (hash == genesis.hash).then(|| Box::new(genesis));
                        let _ = responder
                            .send_to(from, Message::BlockResponse { request_id, block })
                            .await;
                    }
                }
            }
        });

        let genesis = BlockData::genesis();
        let fetched = node1.handle.fetch_block(id2.clone(), genesis.hash).await;
        assert_eq!(fetched, Ok(genesis));

        let missing = BlockHash([7u8; 32]);
        assert_eq!(
            node1.handle.fetch_block(id2, missing).await,
            Err(TransportError::BlockNotFound(missing))
        );
    }

    #[tokio::test]
    async fn request_to_unknown_peer_fails_fast() {
        let node = start(test_config()).await.unwrap();
        let stranger = SigningKeypair::generate().identity();
        let result = node
            .handle
            .fetch_block(stranger.clone(), BlockHash::default())
            .await;
        assert_eq!(result, Err(TransportError::UnknownPeer(stranger)));
    }

    #[test]
    fn hello_with_foreign_key_rejected() {
        let kp = SigningKeypair::generate();
        let other = SigningKeypair::generate();
        assert!(check_hello(PROTOCOL_VERSION, &kp.identity(), &kp.public).is_ok());
        assert!(check_hello(PROTOCOL_VERSION, &kp.identity(), &other.public).is_err());
        assert!(check_hello(PROTOCOL_VERSION + 1, &kp.identity(), &kp.public).is_err());
    }

    #[test]
    fn ack_signed_by_other_key_rejected() {
        let kp = SigningKeypair::generate();
        let other = SigningKeypair::generate();
        let nonce = [3u8; 32];
        let good = kp.sign(&handshake_digest(&nonce, &kp.identity()));
        assert!(check_ack(&kp.public, &nonce, &kp.identity(), &good).is_ok());
        assert!(check_ack(&kp.public, &[4u8; 32], &kp.identity(), &good).is_err());
        let forged = other.sign(&handshake_digest(&nonce, &kp.identity()));
        assert!(check_ack(&kp.public, &nonce, &kp.identity(), &forged).is_err());
    }

    /// Dial `addr` by hand, announcing `claimed` but answering the nonce
    /// with `signer`. Returns the stream after the node's `HelloAck`.
    async fn dial_as(
        addr: SocketAddr,
        claimed: &SigningKeypair,
        signer: &SigningKeypair,
    ) -> (OwnedReadHalf, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let their_nonce = match read_message(&mut reader, MAX_HANDSHAKE_MESSAGE_BYTES)
            .await
            .unwrap()
        {
            Message::Hello { nonce, .. } => nonce,
            other => panic!("expected Hello, got {:?}", other),
        };
        let hello = Message::Hello {
            version: PROTOCOL_VERSION,
            identity: claimed.identity(),
            public_key: claimed.public.clone(),
            listen_port: 1,
            nonce: [0u8; 32],
        };
        write_message(&mut writer, &hello).await.unwrap();
        let signature = signer.sign(&handshake_digest(&their_nonce, &claimed.identity()));
        write_message(&mut writer, &Message::HelloAck { signature })
            .await
            .unwrap();
        let ack = read_message(&mut reader, MAX_HANDSHAKE_MESSAGE_BYTES).await;
        assert!(matches!(ack, Ok(Message::HelloAck { .. })));
        (reader, writer)
    }

    async fn closed_by_node(reader: &mut OwnedReadHalf) -> bool {
        matches!(
            tokio::time::timeout(
                Duration::from_secs(5),
                read_message(reader, crate::constants::MAX_NETWORK_MESSAGE_BYTES),
            )
            .await,
            Ok(Err(_))
        )
    }

    #[tokio::test]
    async fn impostor_without_key_is_never_admitted() {
        let node = start(test_config()).await.unwrap();
        let victim = SigningKeypair::generate();
        let impostor = SigningKeypair::generate();

        let (mut reader, _writer) = dial_as(node.local_addr, &victim, &impostor).await;
        assert!(closed_by_node(&mut reader).await);
        assert!(node.handle.get_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_connection_for_same_peer_is_closed_unheard() {
        let node1 = start(test_config()).await.unwrap();
        let config2 = test_config();
        let key2 = config2.keypair.clone();
        let mut node2 = start(config2).await.unwrap();
        let mut events1 = node1.events;
        node2.handle.connect(node1.local_addr).await.unwrap();
        next_connected(&mut events1).await;
        next_connected(&mut node2.events).await;

        // A valid handshake for an identity that is already connected.
        let (mut reader, mut writer) = dial_as(node1.local_addr, &key2, &key2).await;
        let voter = SigningKeypair::generate();
        let vote = crate::vote::Vote::new(&voter, key2.identity(), 1);
        let _ = write_message(&mut writer, &Message::NewVote(vote)).await;
        assert!(closed_by_node(&mut reader).await);

        let quiet = tokio::time::timeout(Duration::from_millis(300), events1.recv()).await;
        assert!(quiet.is_err(), "refused connection produced {:?}", quiet);
        let peers = node1.handle.get_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].identity, key2.identity());
    }

    #[tokio::test]
    async fn handle_without_loop_reports_shutdown() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = P2pHandle::from_sender(tx);
        assert!(matches!(handle.get_peers().await, Err(P2pError::Shutdown)));
        assert_eq!(
            handle.fetch_block(Identity::from("x"), BlockHash::default()).await,
            Err(TransportError::Shutdown)
        );
    }
}
