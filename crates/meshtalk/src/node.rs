//! Node state and the overlay protocol engine.
//!
//! `Node` owns everything a running node knows: its identity, its
//! neighbour sets, the seen-message tables driving flood de-duplication,
//! and the pending-query table for chat recipient resolution. The
//! listener ([`crate::server`]) decodes frames and calls the `handle_*`
//! methods here; the methods update the tables and either forward over
//! neighbour sockets, answer with one-shot connections, or surface a chat
//! to the local user.
//!
//! # Locking
//!
//! All shared state lives behind one `std::sync::Mutex` that is never
//! held across an await: de-duplication checks and their inserts happen
//! atomically under the lock, and neighbour enumeration snapshots
//! `Arc<Peer>` handles that are written to after the lock is released.
//! Per-socket write ordering is the peer's own concern ([`crate::peer`]).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use meshtalk_core::config::Config;
use meshtalk_core::keys::{KeyError, KeyPair, PeerId, PublicKey, PEER_ID_LEN};
use meshtalk_core::protocol::{self, Message, MessageId, MsgType, ProtocolError};
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::client::{self, ClientError};
use crate::peer::Peer;

/// How long bootstrap waits for pongs before picking neighbours.
const DISCOVERY_WINDOW: Duration = Duration::from_secs(3);

/// How long `post` waits for a QHIT to resolve the recipient.
const RESOLUTION_WINDOW: Duration = Duration::from_secs(3);

/// Per-read timeout during the JOIN/JACC handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Poll interval while waiting for a JACC's matching parked join.
const PENDING_JOIN_POLL: Duration = Duration::from_millis(50);

/// Pause between sending byes and returning from shutdown, so
/// neighbours get to process them before the listener disappears.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Largest chat body that still fits a frame next to the recipient id.
pub const MAX_CHAT_LEN: usize = u16::MAX as usize - PEER_ID_LEN;

/// Events surfaced to the local user interface.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A chat message addressed to this node arrived.
    Chat { from: SocketAddrV4, body: String },
}

/// Errors from the JOIN/JACC neighbour handshake.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("cannot join yourself")]
    SelfJoin,

    #[error("handshake timed out")]
    Timeout,

    #[error("failed to connect: {0}")]
    Connect(std::io::Error),

    #[error("handshake I/O failed: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("peer sent an invalid peer id: {0}")]
    InvalidPeerId(#[from] KeyError),

    #[error("handshake confirmation named a different peer id")]
    IdentityMismatch,
}

/// Errors from the sender side of POST.
#[derive(Debug, Error)]
pub enum PostError {
    #[error("chat message cannot exceed {max} bytes (got {got})")]
    TooLong { max: usize, got: usize },

    #[error("no address resolved for peer {0}")]
    Unresolved(PeerId),

    #[error("failed to deliver chat message: {0}")]
    Send(#[from] ClientError),
}

/// A JOIN whose first leg completed, parked until the peer's JACC
/// arrives and the socket can be committed as an outbound neighbour.
struct PendingJoin {
    peer_id: PeerId,
    write_half: OwnedWriteHalf,
}

/// Mutable node state, guarded by the node-wide mutex.
#[derive(Default)]
struct State {
    /// Durable outbound neighbours; flood targets. Hard-capped at
    /// `max_connections`.
    outbound: Vec<Arc<Peer>>,
    /// Neighbours registered by accepting a JOIN handshake.
    inbound: Vec<Arc<Peer>>,
    /// Ping id → originator address, for reverse-path pong routing.
    recv_pings: HashMap<MessageId, SocketAddrV4>,
    /// Query id → originator address, for reverse-path qhit routing.
    recv_queries: HashMap<MessageId, SocketAddrV4>,
    /// Ids of pings this node originated.
    sent_pings: HashSet<MessageId>,
    /// Ids of queries this node originated.
    sent_queries: HashSet<MessageId>,
    /// Addresses harvested from pongs during the discovery window.
    candidates: Vec<SocketAddrV4>,
    /// Recipient resolution table; `None` marks a query in flight.
    recipients: HashMap<PeerId, Option<SocketAddrV4>>,
    /// Joins awaiting the peer's JACC.
    pending_joins: HashMap<SocketAddrV4, PendingJoin>,
}

/// One overlay node: identity plus all shared state.
pub struct Node {
    config: Config,
    host_addr: SocketAddrV4,
    keys: KeyPair,
    peer_id: PeerId,
    state: Mutex<State>,
    events: broadcast::Sender<NodeEvent>,
}

impl Node {
    /// Creates a node with a freshly generated identity, reachable at
    /// `host_addr` (the address other peers will be told to connect to).
    pub fn new(config: Config, host_addr: SocketAddrV4) -> Self {
        let mut rng = rand::thread_rng();
        let (keys, peer_id) = loop {
            let keys = KeyPair::generate(&mut rng);
            if let Ok(peer_id) = PeerId::from_public_key(&keys.public) {
                break (keys, peer_id);
            }
        };
        let (events, _) = broadcast::channel(64);
        Node {
            config,
            host_addr,
            keys,
            peer_id,
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// This node's addressable identity.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// This node's public key.
    pub fn public_key(&self) -> PublicKey {
        self.keys.public
    }

    /// The listening endpoint written into originated headers.
    pub fn host_addr(&self) -> SocketAddrV4 {
        self.host_addr
    }

    /// Subscribes to events surfaced for the local user.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Addresses of the current outbound neighbours.
    pub fn outbound_addrs(&self) -> Vec<SocketAddrV4> {
        self.state().outbound.iter().map(|p| p.addr()).collect()
    }

    /// Addresses of the current inbound neighbours.
    pub fn inbound_addrs(&self) -> Vec<SocketAddrV4> {
        self.state().inbound.iter().map(|p| p.addr()).collect()
    }

    /// Neighbour candidates harvested so far.
    pub fn neighbour_candidates(&self) -> Vec<SocketAddrV4> {
        self.state().candidates.clone()
    }

    /// Whether a ping with this id has been received.
    pub fn seen_ping(&self, id: MessageId) -> bool {
        self.state().recv_pings.contains_key(&id)
    }

    /// Number of distinct pings received so far.
    pub fn seen_ping_count(&self) -> usize {
        self.state().recv_pings.len()
    }

    /// Locks node state. A poisoned lock is recovered; the maps are
    /// valid after any individual insert or remove.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Builds a freshly originated message with this node's header fields.
    fn make_message(&self, msg_type: MsgType, payload: impl Into<Vec<u8>>) -> Message {
        Message::new(
            msg_type,
            self.host_addr,
            self.config.protocol.version,
            self.config.protocol.ttl,
            payload,
        )
    }

    // -----------------------------------------------------------------------
    // Neighbour registration
    // -----------------------------------------------------------------------

    /// Opens a durable outbound connection to `addr` and registers it.
    pub async fn connect_neighbour(&self, addr: SocketAddrV4) -> std::io::Result<()> {
        let peer = Peer::connect(addr).await?;
        self.add_outbound(Arc::new(peer)).await;
        Ok(())
    }

    /// Registers an outbound neighbour unless the hard cap is reached or
    /// the address is already present.
    async fn add_outbound(&self, peer: Arc<Peer>) {
        let rejected = {
            let mut state = self.state();
            if state.outbound.len() >= self.config.max_connections
                || state.outbound.iter().any(|p| p.addr() == peer.addr())
            {
                true
            } else {
                state.outbound.push(Arc::clone(&peer));
                false
            }
        };
        if rejected {
            debug!(addr = %peer.addr(), "not registering neighbour (duplicate or at capacity)");
            peer.disconnect().await;
        }
    }

    /// Removes an outbound neighbour after a failed write and closes its
    /// socket.
    async fn drop_outbound(&self, addr: SocketAddrV4) {
        let peer = {
            let mut state = self.state();
            state
                .outbound
                .iter()
                .position(|p| p.addr() == addr)
                .map(|i| state.outbound.remove(i))
        };
        if let Some(peer) = peer {
            peer.disconnect().await;
        }
    }

    /// Sends `msg` to every peer in `targets`, dropping neighbours whose
    /// socket fails.
    async fn send_to_peers(&self, targets: Vec<Arc<Peer>>, msg: &Message) {
        for peer in targets {
            if let Err(e) = peer.send(msg).await {
                warn!(addr = %peer.addr(), error = %e, "write to neighbour failed, dropping peer");
                self.drop_outbound(peer.addr()).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------------

    /// Joins the network by pinging a known peer, collecting pong
    /// candidates for a fixed window, then connecting to a random sample
    /// of them.
    pub async fn bootstrap(&self, addr: SocketAddrV4) {
        info!(%addr, "attempting to bootstrap");
        if addr == self.host_addr {
            warn!("aborting bootstrap: cannot bootstrap with yourself, continuing as detached peer");
            return;
        }

        let ping = self.make_message(MsgType::Ping, Vec::new());
        self.state().sent_pings.insert(ping.id());
        if let Err(e) = client::send_one_shot(addr, &ping).await {
            warn!(error = %e, "bootstrapping failed, continuing as detached peer");
            return;
        }

        // Let pongs accumulate before picking neighbours.
        sleep(DISCOVERY_WINDOW).await;

        let picks: Vec<SocketAddrV4> = {
            let mut state = self.state();
            debug!(candidates = ?state.candidates, "discovery window closed");
            let picks = state
                .candidates
                .choose_multiple(&mut rand::thread_rng(), self.config.neighbours)
                .copied()
                .collect();
            state.candidates.clear();
            picks
        };

        for addr in picks {
            match self.connect_neighbour(addr).await {
                Ok(()) => info!(%addr, "connecting new neighbour (bootstrapping)"),
                Err(e) => warn!(%addr, error = %e, "failed to connect neighbour candidate"),
            }
        }
        debug!(peer_id = %self.peer_id, "finished bootstrapping");
    }

    // -----------------------------------------------------------------------
    // PING / PONG
    // -----------------------------------------------------------------------

    /// Handles an incoming ping: record, forward within bounds, answer
    /// with a pong, and opportunistically adopt the sender as a
    /// neighbour.
    pub async fn handle_ping(&self, mut msg: Message) {
        let sender = msg.sender();
        let id = msg.id();

        let (targets, should_pong, should_adopt) = {
            let mut state = self.state();
            if state.recv_pings.contains_key(&id)
                || state.sent_pings.contains(&id)
                || sender == self.host_addr
            {
                debug!(%id, "rejecting ping: already received");
                return;
            }
            state.recv_pings.insert(id, sender);

            msg.header.ttl = msg.header.ttl.saturating_sub(1);
            msg.header.hop_count = msg.header.hop_count.saturating_add(1);

            let targets: Vec<Arc<Peer>> =
                if msg.header.ttl > 0 && msg.header.hop_count <= self.config.protocol.max_ttl {
                    state
                        .outbound
                        .iter()
                        .filter(|p| p.addr() != sender)
                        .cloned()
                        .collect()
                } else {
                    Vec::new()
                };
            (
                targets,
                state.outbound.len() < self.config.max_connections,
                state.outbound.len() < self.config.neighbours,
            )
        };

        if !targets.is_empty() {
            debug!(%id, count = targets.len(), "forwarding ping to neighbours");
        }
        self.send_to_peers(targets, &msg).await;

        if should_pong {
            // Same id as the ping, so the originator can correlate.
            let pong = Message::with_id(
                MsgType::Pong,
                self.host_addr,
                self.config.protocol.version,
                self.config.protocol.ttl,
                id,
                Vec::new(),
            );
            if let Err(e) = client::send_one_shot(sender, &pong).await {
                warn!(%sender, error = %e, "failed to send pong");
            }
        }

        if should_adopt {
            match self.connect_neighbour(sender).await {
                Ok(()) => info!(%sender, "connecting to new neighbour after ping"),
                Err(e) => warn!(%sender, error = %e, "failed to connect new neighbour"),
            }
        }
    }

    /// Handles an incoming pong: harvest the sender as a neighbour
    /// candidate, and reverse-path-route pongs correlated to a ping this
    /// node relayed.
    pub async fn handle_pong(&self, mut msg: Message) {
        let sender = msg.sender();
        let id = msg.id();

        let origin = {
            let mut state = self.state();
            if state.outbound.len() < self.config.max_connections
                && sender != self.host_addr
                && !state.candidates.contains(&sender)
            {
                state.candidates.push(sender);
            }
            if state.sent_pings.contains(&id) {
                // Answer to our own ping; the candidate is all we needed.
                return;
            }
            match state.recv_pings.get(&id) {
                Some(&origin) => origin,
                None => {
                    debug!(%id, "rejecting pong: unknown message id");
                    return;
                }
            }
        };

        msg.header.ttl = msg.header.ttl.saturating_sub(1);
        msg.header.hop_count = msg.header.hop_count.saturating_add(1);
        if msg.header.ttl > 0 && msg.header.hop_count <= self.config.protocol.max_ttl {
            if let Err(e) = client::send_one_shot(origin, &msg).await {
                warn!(%origin, error = %e, "failed to reverse-path route pong");
            }
        }
    }

    // -----------------------------------------------------------------------
    // QUERY / QHIT
    // -----------------------------------------------------------------------

    /// Handles an incoming query: answer with a QHIT when the searched
    /// key is our own, otherwise forward within bounds.
    pub async fn handle_query(&self, mut msg: Message) {
        let sender = msg.sender();
        let id = msg.id();

        {
            let mut state = self.state();
            if state.recv_queries.contains_key(&id)
                || state.sent_queries.contains(&id)
                || sender == self.host_addr
            {
                debug!(%id, "rejecting query: already received");
                return;
            }
            state.recv_queries.insert(id, sender);
        }

        let target_key = {
            let text = msg.payload_text();
            match PeerId::parse(text.as_ref()).and_then(|pid| pid.to_public_key()) {
                Ok(key) => key,
                Err(e) => {
                    warn!(%sender, error = %e, "dropping query with malformed peer id");
                    return;
                }
            }
        };

        if target_key == self.keys.public {
            debug!(%sender, "query matches own key, replying with qhit");
            let qhit = Message::with_id(
                MsgType::Qhit,
                self.host_addr,
                self.config.protocol.version,
                self.config.protocol.ttl,
                id,
                self.peer_id.as_str().as_bytes().to_vec(),
            );
            if let Err(e) = client::send_one_shot(sender, &qhit).await {
                warn!(%sender, error = %e, "failed to send qhit");
            }
            return;
        }

        msg.header.ttl = msg.header.ttl.saturating_sub(1);
        msg.header.hop_count = msg.header.hop_count.saturating_add(1);
        if msg.header.ttl > 0 && msg.header.hop_count <= self.config.protocol.max_ttl {
            let targets: Vec<Arc<Peer>> = {
                let state = self.state();
                state
                    .outbound
                    .iter()
                    .filter(|p| p.addr() != sender)
                    .cloned()
                    .collect()
            };
            self.send_to_peers(targets, &msg).await;
        }
    }

    /// Handles an incoming query hit: resolve a pending recipient lookup
    /// of our own, or reverse-path-route the hit towards the query's
    /// origin.
    pub async fn handle_qhit(&self, mut msg: Message) {
        let sender = msg.sender();
        let id = msg.id();

        let resolved = {
            let prefix = msg
                .payload
                .get(..PEER_ID_LEN)
                .and_then(|bytes| std::str::from_utf8(bytes).ok());
            match prefix.map(PeerId::parse) {
                Some(Ok(pid)) => pid,
                _ => {
                    debug!(%sender, "dropping qhit with malformed peer id");
                    return;
                }
            }
        };

        let origin = {
            let mut state = self.state();
            if let Some(entry) = state.recipients.get_mut(&resolved) {
                info!(peer_id = %resolved, addr = %sender, "recipient resolved");
                *entry = Some(sender);
                return;
            }
            match state.recv_queries.get(&id) {
                Some(&origin) => origin,
                None => {
                    debug!(%id, "rejecting qhit: unknown message id");
                    return;
                }
            }
        };

        msg.header.ttl = msg.header.ttl.saturating_sub(1);
        msg.header.hop_count = msg.header.hop_count.saturating_add(1);
        if msg.header.ttl > 0 && msg.header.hop_count <= self.config.protocol.max_ttl {
            if let Err(e) = client::send_one_shot(origin, &msg).await {
                warn!(%origin, error = %e, "failed to reverse-path route qhit");
            }
        }
    }

    // -----------------------------------------------------------------------
    // POST
    // -----------------------------------------------------------------------

    /// Handles an incoming chat message addressed to this node.
    pub fn handle_post(&self, msg: Message) {
        if msg.payload.len() < PEER_ID_LEN {
            warn!(len = msg.payload.len(), "dropping post with short payload");
            return;
        }
        let (prefix, body) = msg.payload.split_at(PEER_ID_LEN);
        let Ok(recipient) = std::str::from_utf8(prefix) else {
            warn!("dropping post with non-text recipient prefix");
            return;
        };
        if recipient != self.peer_id.as_str() {
            warn!(recipient, "dropping post addressed to a different peer");
            return;
        }
        let body = String::from_utf8_lossy(body).into_owned();
        info!(from = %msg.sender(), "chat message received");
        let _ = self.events.send(NodeEvent::Chat {
            from: msg.sender(),
            body,
        });
    }

    /// Sends a chat message to `recipient`, resolving its address through
    /// a QUERY flood first if necessary.
    pub async fn post(&self, recipient: PeerId, body: &str) -> Result<(), PostError> {
        if body.len() > MAX_CHAT_LEN {
            return Err(PostError::TooLong {
                max: MAX_CHAT_LEN,
                got: body.len(),
            });
        }

        let needs_query = {
            let mut state = self.state();
            if state.recipients.contains_key(&recipient) {
                false
            } else {
                state.recipients.insert(recipient.clone(), None);
                true
            }
        };

        if needs_query {
            let query = self.make_message(MsgType::Query, recipient.as_str().as_bytes().to_vec());
            let targets: Vec<Arc<Peer>> = {
                let mut state = self.state();
                state.sent_queries.insert(query.id());
                state.outbound.to_vec()
            };
            if targets.is_empty() {
                warn!("posting without neighbours: query cannot propagate");
            }
            debug!(peer_id = %recipient, "flooding query for recipient");
            self.send_to_peers(targets, &query).await;
        }

        let addr = match self.resolved_recipient(&recipient) {
            Some(addr) => addr,
            None => {
                sleep(RESOLUTION_WINDOW).await;
                self.resolved_recipient(&recipient)
                    .ok_or_else(|| PostError::Unresolved(recipient.clone()))?
            }
        };

        let mut payload = Vec::with_capacity(PEER_ID_LEN + body.len());
        payload.extend_from_slice(recipient.as_str().as_bytes());
        payload.extend_from_slice(body.as_bytes());
        let post = self.make_message(MsgType::Post, payload);
        info!(peer_id = %recipient, %addr, "delivering chat message");
        client::send_one_shot(addr, &post).await?;
        Ok(())
    }

    fn resolved_recipient(&self, recipient: &PeerId) -> Option<SocketAddrV4> {
        self.state().recipients.get(recipient).copied().flatten()
    }

    // -----------------------------------------------------------------------
    // JOIN / JACC
    // -----------------------------------------------------------------------

    /// Initiates the mutual neighbour handshake with the node at `addr`.
    ///
    /// Sends JOIN with our peer id and reads the peer's id back on the
    /// same socket. The socket is then parked until the peer's JACC
    /// arrives; only [`Node::handle_jacc`] commits it as an outbound
    /// neighbour, so an aborted handshake leaves no neighbour state.
    pub async fn join(&self, addr: SocketAddrV4) -> Result<(), JoinError> {
        if addr == self.host_addr {
            return Err(JoinError::SelfJoin);
        }
        let mut stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| JoinError::Timeout)?
            .map_err(JoinError::Connect)?;

        let join_msg = self.make_message(MsgType::Join, self.peer_id.as_str().as_bytes().to_vec());
        protocol::write_message(&mut stream, &join_msg).await?;

        let mut reply = [0u8; PEER_ID_LEN];
        timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut reply))
            .await
            .map_err(|_| JoinError::Timeout)?
            .map_err(ProtocolError::Io)?;
        let responder = PeerId::parse(&String::from_utf8_lossy(&reply))?;

        let (_read_half, write_half) = stream.into_split();
        self.state().pending_joins.insert(
            addr,
            PendingJoin {
                peer_id: responder,
                write_half,
            },
        );
        info!(%addr, "join handshake sent, awaiting acceptance");
        Ok(())
    }

    /// Responder side of the handshake: reply with our peer id on the
    /// same socket, then connect back with a JACC and commit the inbound
    /// entry once the initiator confirms.
    pub async fn handle_join(&self, msg: Message, stream: &mut TcpStream) {
        let sender = msg.sender();
        let initiator = {
            let text = msg.payload_text();
            match PeerId::parse(text.as_ref()) {
                Ok(pid) => pid,
                Err(e) => {
                    warn!(%sender, error = %e, "rejecting join: invalid peer id");
                    return;
                }
            }
        };

        let at_capacity = { self.state().outbound.len() >= self.config.max_connections };
        if at_capacity {
            debug!(%sender, "rejecting join: at connection capacity");
            return;
        }

        if let Err(e) = stream.write_all(self.peer_id.as_str().as_bytes()).await {
            warn!(%sender, error = %e, "join handshake write failed");
            return;
        }
        if let Err(e) = stream.flush().await {
            warn!(%sender, error = %e, "join handshake write failed");
            return;
        }

        match self.accept_join(sender, initiator).await {
            Ok(()) => info!(%sender, "join handshake complete, inbound neighbour registered"),
            Err(e) => warn!(%sender, error = %e, "join handshake failed, not committing neighbour"),
        }
    }

    /// Second leg of the responder side: JACC over a fresh connection,
    /// then the initiator's confirmation.
    async fn accept_join(&self, addr: SocketAddrV4, initiator: PeerId) -> Result<(), JoinError> {
        let mut stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| JoinError::Timeout)?
            .map_err(JoinError::Connect)?;

        let jacc = self.make_message(MsgType::Jacc, self.peer_id.as_str().as_bytes().to_vec());
        protocol::write_message(&mut stream, &jacc).await?;

        let mut confirmation = [0u8; PEER_ID_LEN];
        timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut confirmation))
            .await
            .map_err(|_| JoinError::Timeout)?
            .map_err(ProtocolError::Io)?;
        let confirmed = PeerId::parse(&String::from_utf8_lossy(&confirmation))?;
        if confirmed != initiator {
            return Err(JoinError::IdentityMismatch);
        }

        let (_read_half, write_half) = stream.into_split();
        let peer = Arc::new(Peer::from_parts(addr, Some(initiator), write_half));
        self.state().inbound.push(peer);
        Ok(())
    }

    /// Initiator side, final leg: the peer accepted our JOIN. Confirm on
    /// the JACC socket and commit the parked JOIN socket as an outbound
    /// neighbour.
    pub async fn handle_jacc(&self, msg: Message, stream: &mut TcpStream) {
        let sender = msg.sender();
        let responder = {
            let text = msg.payload_text();
            match PeerId::parse(text.as_ref()) {
                Ok(pid) => pid,
                Err(e) => {
                    warn!(%sender, error = %e, "rejecting jacc: invalid peer id");
                    return;
                }
            }
        };

        // The JACC can arrive before `join` has parked its socket, so
        // poll the table briefly before treating it as unsolicited.
        let mut pending = None;
        let mut waited = Duration::ZERO;
        loop {
            if let Some(found) = self.state().pending_joins.remove(&sender) {
                pending = Some(found);
                break;
            }
            if waited >= HANDSHAKE_TIMEOUT {
                break;
            }
            sleep(PENDING_JOIN_POLL).await;
            waited += PENDING_JOIN_POLL;
        }
        let Some(pending) = pending else {
            warn!(%sender, "ignoring unsolicited jacc");
            return;
        };
        if pending.peer_id != responder {
            // Dropping the parked write half closes the join socket.
            warn!(%sender, "jacc peer id does not match the join reply, aborting handshake");
            return;
        }

        if let Err(e) = stream.write_all(self.peer_id.as_str().as_bytes()).await {
            warn!(%sender, error = %e, "jacc confirmation write failed, aborting handshake");
            return;
        }
        if let Err(e) = stream.flush().await {
            warn!(%sender, error = %e, "jacc confirmation write failed, aborting handshake");
            return;
        }

        let peer = Arc::new(Peer::from_parts(sender, Some(responder), pending.write_half));
        info!(%sender, "jacc accepted, outbound neighbour registered");
        self.add_outbound(peer).await;
    }

    // -----------------------------------------------------------------------
    // BYE / shutdown
    // -----------------------------------------------------------------------

    /// Handles a departure announcement: remove the outbound neighbour
    /// with the sender's address and close its socket.
    pub async fn handle_bye(&self, msg: Message) {
        let sender = msg.sender();
        let peer = {
            let mut state = self.state();
            state
                .outbound
                .iter()
                .position(|p| p.addr() == sender)
                .map(|i| state.outbound.remove(i))
        };
        match peer {
            Some(peer) => {
                info!(%sender, "neighbour left the network");
                peer.disconnect().await;
            }
            None => debug!(%sender, "bye from non-neighbour"),
        }
    }

    /// Orderly departure: BYE to every outbound neighbour, close the
    /// sockets, and give the byes a moment to be processed. The caller
    /// tears down the listener afterwards.
    pub async fn shutdown(&self) {
        info!("disconnecting from peers");
        let peers: Vec<Arc<Peer>> = {
            let mut state = self.state();
            state.outbound.drain(..).collect()
        };
        let bye = self.make_message(MsgType::Bye, Vec::new());
        for peer in &peers {
            debug!(addr = %peer.addr(), "sending bye to neighbour");
            if let Err(e) = peer.send(&bye).await {
                debug!(addr = %peer.addr(), error = %e, "bye not delivered");
            }
        }
        for peer in &peers {
            peer.disconnect().await;
        }
        sleep(SHUTDOWN_GRACE).await;
    }
}
