//! In-process transport
//!
//! A complete implementation of the wire surface with both ends living in
//! one process: the relay side speaks the crate traits, the agent side
//! drives [`AgentConnection`]. Channel bytes travel over `tokio::io`
//! duplex pairs and requests over bounded queues with oneshot replies.
//!
//! This is the transport the test suites run end-to-end scenarios on and
//! the quickest way to exercise a relay locally; production deployments
//! plug a real SSH binding into the same traits.

use crate::{
    AuthMethod, ChannelOffer, ChannelOffers, ChannelRequest, ChannelStream, ClientHandshaker,
    OutboundChannel, PendingConnection, RequestStream, SshClient, TunnelConnection,
    TunnelListener, WireError, WireResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use gridlink_proto::Permissions;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::trace;

/// Buffer size of a channel's byte stream.
const CHANNEL_BUFFER: usize = 64 * 1024;

/// Depth of the offer and request queues.
const QUEUE_DEPTH: usize = 32;

type OfferSender = mpsc::Sender<Box<dyn ChannelOffer>>;
type OfferSlot = StdMutex<Option<OfferSender>>;

/// State shared by both ends of one connection.
#[derive(Debug)]
struct Shared {
    remote_addr: SocketAddr,
    closed: AtomicBool,
    deadline: StdMutex<Option<Instant>>,
}

impl Shared {
    fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock().unwrap()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Run `fut` under the connection deadline, if one is installed.
async fn with_deadline<F>(shared: &Shared, fut: F) -> WireResult<F::Output>
where
    F: Future,
{
    match shared.deadline() {
        Some(deadline) => timeout_at(deadline, fut)
            .await
            .map_err(|_| WireError::TimedOut),
        None => Ok(fut.await),
    }
}

/// Open a channel toward the peer whose offer queue sits behind `slot`.
async fn open_channel_on(
    slot: &OfferSlot,
    shared: &Arc<Shared>,
    channel_type: &str,
) -> WireResult<Box<dyn OutboundChannel>> {
    if shared.is_closed() {
        return Err(WireError::ConnectionClosed);
    }
    let sender = slot
        .lock()
        .unwrap()
        .clone()
        .ok_or(WireError::ConnectionClosed)?;

    let (local, remote) = tokio::io::duplex(CHANNEL_BUFFER);
    let (req_tx, req_rx) = mpsc::channel(QUEUE_DEPTH);
    let (decision_tx, decision_rx) = oneshot::channel();

    let offer: Box<dyn ChannelOffer> = Box::new(MemChannelOffer {
        channel_type: channel_type.to_string(),
        stream: Some(remote),
        requests: Some(req_rx),
        decision: Some(decision_tx),
    });
    with_deadline(shared, sender.send(offer))
        .await?
        .map_err(|_| WireError::ConnectionClosed)?;

    match with_deadline(shared, decision_rx).await? {
        Ok(Ok(())) => {
            trace!(channel_type, "channel accepted by peer");
            Ok(Box::new(MemChannel {
                stream: local,
                requests: req_tx,
                shared: Arc::clone(shared),
            }))
        }
        Ok(Err(reason)) => Err(WireError::ChannelRejected(reason)),
        Err(_) => Err(WireError::ConnectionClosed),
    }
}

/// Opener-side handle of a channel.
struct MemChannel {
    stream: DuplexStream,
    requests: mpsc::Sender<ChannelRequest>,
    shared: Arc<Shared>,
}

#[async_trait]
impl OutboundChannel for MemChannel {
    async fn request(&mut self, name: &str, want_reply: bool, payload: &[u8]) -> WireResult<bool> {
        if self.shared.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        let (req, reply_rx) = ChannelRequest::new(name, want_reply, Bytes::copy_from_slice(payload));
        with_deadline(&self.shared, self.requests.send(req))
            .await?
            .map_err(|_| WireError::RequestFailed("channel closed".to_string()))?;

        match reply_rx {
            Some(rx) => match with_deadline(&self.shared, rx).await? {
                Ok(answer) => Ok(answer),
                Err(_) => Err(WireError::RequestFailed("no reply from peer".to_string())),
            },
            None => Ok(false),
        }
    }

    fn into_stream(self: Box<Self>) -> Box<dyn ChannelStream> {
        Box::new(self.stream)
    }
}

/// Acceptor-side view of a channel the peer wants to open.
struct MemChannelOffer {
    channel_type: String,
    stream: Option<DuplexStream>,
    requests: Option<mpsc::Receiver<ChannelRequest>>,
    decision: Option<oneshot::Sender<Result<(), String>>>,
}

#[async_trait]
impl ChannelOffer for MemChannelOffer {
    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    async fn accept(mut self: Box<Self>) -> WireResult<(Box<dyn ChannelStream>, RequestStream)> {
        let (Some(decision), Some(stream), Some(requests)) = (
            self.decision.take(),
            self.stream.take(),
            self.requests.take(),
        ) else {
            return Err(WireError::ConnectionClosed);
        };
        decision
            .send(Ok(()))
            .map_err(|_| WireError::ConnectionClosed)?;
        Ok((Box::new(stream), RequestStream::new(requests)))
    }

    async fn reject(mut self: Box<Self>, reason: &str) {
        if let Some(decision) = self.decision.take() {
            let _ = decision.send(Err(reason.to_string()));
        }
    }
}

impl Drop for MemChannelOffer {
    fn drop(&mut self) {
        if let Some(decision) = self.decision.take() {
            let _ = decision.send(Err("channel not accepted".to_string()));
        }
    }
}

/// Relay-side authenticated connection.
pub struct MemConnection {
    offers: OfferSlot,
    shared: Arc<Shared>,
    permissions: Permissions,
}

impl fmt::Debug for MemConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemConnection")
            .field("remote_addr", &self.shared.remote_addr)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

#[async_trait]
impl TunnelConnection for MemConnection {
    async fn open_channel(&self, channel_type: &str) -> WireResult<Box<dyn OutboundChannel>> {
        open_channel_on(&self.offers, &self.shared, channel_type).await
    }

    fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        *self.shared.deadline.lock().unwrap() = deadline;
    }

    async fn close(&self) {
        self.shared.close();
        self.offers.lock().unwrap().take();
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

/// Agent-side end of a connection, handed out once the relay authorizes
/// the handshake.
pub struct AgentConnection {
    offers: mpsc::Receiver<Box<dyn ChannelOffer>>,
    open_tx: OfferSlot,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection").finish_non_exhaustive()
    }
}

impl AgentConnection {
    /// Open a channel toward the relay (e.g. the heartbeat channel).
    pub async fn open_channel(&self, channel_type: &str) -> WireResult<Box<dyn OutboundChannel>> {
        open_channel_on(&self.open_tx, &self.shared, channel_type).await
    }

    /// Next channel the relay opened toward us, or `None` once the
    /// connection is closed.
    pub async fn next_channel(&mut self) -> Option<Box<dyn ChannelOffer>> {
        self.offers.recv().await
    }

    /// Close the connection: future channel opens and requests on either
    /// end fail, and both offer queues end.
    pub fn close(&self) {
        self.shared.close();
        self.open_tx.lock().unwrap().take();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

/// Pre-authentication connection as seen by the relay.
struct MemPending {
    user: String,
    presented_key: String,
    remote_addr: SocketAddr,
    auth: Option<oneshot::Sender<Result<AgentConnection, String>>>,
}

#[async_trait]
impl PendingConnection for MemPending {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn user(&self) -> &str {
        &self.user
    }

    fn presented_key(&self) -> &str {
        &self.presented_key
    }

    async fn authorize(
        mut self: Box<Self>,
        permissions: Permissions,
    ) -> WireResult<(Arc<dyn TunnelConnection>, ChannelOffers)> {
        let auth = self.auth.take().ok_or(WireError::ConnectionClosed)?;
        let shared = Arc::new(Shared {
            remote_addr: self.remote_addr,
            closed: AtomicBool::new(false),
            deadline: StdMutex::new(None),
        });

        let (to_agent_tx, to_agent_rx) = mpsc::channel(QUEUE_DEPTH);
        let (to_relay_tx, to_relay_rx) = mpsc::channel(QUEUE_DEPTH);

        let agent = AgentConnection {
            offers: to_agent_rx,
            open_tx: StdMutex::new(Some(to_relay_tx)),
            shared: Arc::clone(&shared),
        };
        let conn = Arc::new(MemConnection {
            offers: StdMutex::new(Some(to_agent_tx)),
            shared,
            permissions,
        });
        auth.send(Ok(agent))
            .map_err(|_| WireError::ConnectionClosed)?;
        Ok((conn, ChannelOffers::new(to_relay_rx)))
    }

    async fn reject(mut self: Box<Self>, reason: &str) {
        if let Some(auth) = self.auth.take() {
            let _ = auth.send(Err(reason.to_string()));
        }
    }
}

/// In-process listener.
pub struct MemListener {
    incoming: Mutex<mpsc::Receiver<Box<dyn PendingConnection>>>,
    addr: SocketAddr,
}

impl fmt::Debug for MemListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemListener")
            .field("addr", &self.addr)
            .finish()
    }
}

#[async_trait]
impl TunnelListener for MemListener {
    async fn accept(&self) -> WireResult<Box<dyn PendingConnection>> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(WireError::ListenerClosed)
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn close(&self) {
        self.incoming.lock().await.close();
    }
}

/// Agent-side connector paired with a [`MemListener`].
#[derive(Clone)]
pub struct MemConnector {
    tx: mpsc::Sender<Box<dyn PendingConnection>>,
    addr: SocketAddr,
}

impl MemConnector {
    /// Connect to the listener, presenting an SSH user name and an
    /// OpenSSH-encoded key or certificate. Resolves once the relay has
    /// authorized or rejected the handshake.
    pub async fn connect(
        &self,
        user: &str,
        presented_key: &str,
        remote_addr: SocketAddr,
    ) -> WireResult<AgentConnection> {
        let (auth_tx, auth_rx) = oneshot::channel();
        let pending: Box<dyn PendingConnection> = Box::new(MemPending {
            user: user.to_string(),
            presented_key: presented_key.to_string(),
            remote_addr,
            auth: Some(auth_tx),
        });
        self.tx
            .send(pending)
            .await
            .map_err(|_| WireError::ListenerClosed)?;

        match auth_rx.await {
            Ok(Ok(agent)) => Ok(agent),
            Ok(Err(reason)) => Err(WireError::AccessDenied(reason)),
            Err(_) => Err(WireError::ConnectionClosed),
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Create a linked listener/connector pair.
pub fn listener(addr: SocketAddr) -> (MemListener, MemConnector) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    (
        MemListener {
            incoming: Mutex::new(rx),
            addr,
        },
        MemConnector { tx, addr },
    )
}

/// Client-handshake stand-in that passes the dialed stream through as a
/// single session without negotiating SSH.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainHandshaker;

#[async_trait]
impl ClientHandshaker for PlainHandshaker {
    async fn handshake(
        &self,
        stream: Box<dyn ChannelStream>,
        _addr: &str,
        _user: &str,
        _methods: &[AuthMethod],
    ) -> WireResult<Box<dyn SshClient>> {
        Ok(Box::new(PlainClient {
            session: Some(stream),
        }))
    }
}

struct PlainClient {
    session: Option<Box<dyn ChannelStream>>,
}

#[async_trait]
impl SshClient for PlainClient {
    async fn open_session(&mut self) -> WireResult<Box<dyn ChannelStream>> {
        self.session.take().ok_or(WireError::ConnectionClosed)
    }

    async fn close(&mut self) -> WireResult<()> {
        self.session = None;
        Ok(())
    }
}
