//! SSH framing abstraction for the gridlink reverse tunnel
//!
//! This crate defines the surface the tunnel core consumes from an SSH
//! engine, without coupling to any specific implementation: accepting
//! inbound connections, driving public-key authentication, opening
//! multiplexed channels, and exchanging channel requests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    gridlink-relay                        │
//! │        (tunnel server, sites, connection pools)          │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │               gridlink-wire (this crate)                 │
//! │  - TunnelListener      - PendingConnection               │
//! │  - TunnelConnection    - ChannelOffer / OutboundChannel  │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────────────┬──────────────────────────────────┐
//! │  mem (in-process,    │  out-of-tree SSH bindings        │
//! │  tests + local dev)  │                                  │
//! └──────────────────────┴──────────────────────────────────┘
//! ```
//!
//! Certificates and key material are handled by the `ssh-key` crate; the
//! presented key travels in OpenSSH text encoding so implementations do
//! not need to agree on a parsed representation.

pub mod mem;

use async_trait::async_trait;
use bytes::Bytes;
use gridlink_proto::Permissions;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Wire-level errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("listener closed")]
    ListenerClosed,

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("channel rejected: {0}")]
    ChannelRejected(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("operation timed out")]
    TimedOut,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for wire operations
pub type WireResult<T> = Result<T, WireError>;

/// A channel exposed as an ordered bidirectional byte stream.
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelStream for T {}

impl std::fmt::Debug for dyn ChannelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChannelStream")
    }
}

/// A request received on an accepted channel.
///
/// Heartbeat keepalives arrive this way (no reply expected), as do dial
/// directives on transport channels (boolean reply expected).
pub struct ChannelRequest {
    name: String,
    want_reply: bool,
    payload: Bytes,
    reply: Option<oneshot::Sender<bool>>,
}

impl ChannelRequest {
    pub(crate) fn new(
        name: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> (Self, Option<oneshot::Receiver<bool>>) {
        let (tx, rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let req = Self {
            name: name.to_string(),
            want_reply,
            payload,
            reply: tx,
        };
        (req, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Answer the request. A no-op when the sender did not ask for a
    /// reply; dropping an unanswered request fails it on the sender side.
    pub fn reply(mut self, ok: bool) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(ok);
        }
    }
}

impl fmt::Debug for ChannelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("name", &self.name)
            .field("want_reply", &self.want_reply)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Stream of requests arriving on an accepted channel.
pub struct RequestStream {
    rx: mpsc::Receiver<ChannelRequest>,
}

impl RequestStream {
    pub(crate) fn new(rx: mpsc::Receiver<ChannelRequest>) -> Self {
        Self { rx }
    }

    /// Next request, or `None` once the peer's side of the channel is gone.
    pub async fn next(&mut self) -> Option<ChannelRequest> {
        self.rx.recv().await
    }
}

/// Stream of channel offers arriving on an authenticated connection.
pub struct ChannelOffers {
    rx: mpsc::Receiver<Box<dyn ChannelOffer>>,
}

impl ChannelOffers {
    pub(crate) fn new(rx: mpsc::Receiver<Box<dyn ChannelOffer>>) -> Self {
        Self { rx }
    }

    /// Next offer, or `None` once the connection is closed.
    pub async fn next(&mut self) -> Option<Box<dyn ChannelOffer>> {
        self.rx.recv().await
    }
}

/// A channel we opened on a connection.
#[async_trait]
pub trait OutboundChannel: Send {
    /// Send a channel request. With `want_reply`, resolves to the peer's
    /// boolean answer; without, resolves to `false` once sent.
    async fn request(&mut self, name: &str, want_reply: bool, payload: &[u8]) -> WireResult<bool>;

    /// Consume the handle and expose the channel as a byte stream.
    fn into_stream(self: Box<Self>) -> Box<dyn ChannelStream>;
}

impl std::fmt::Debug for dyn OutboundChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OutboundChannel")
    }
}

/// A channel the peer wants to open on an authenticated connection.
///
/// Offers that are dropped without a decision are rejected by the
/// implementation.
#[async_trait]
pub trait ChannelOffer: Send {
    fn channel_type(&self) -> &str;

    /// Accept the channel, yielding its byte stream and request stream.
    async fn accept(self: Box<Self>) -> WireResult<(Box<dyn ChannelStream>, RequestStream)>;

    /// Refuse the channel with a reason reported to the opener.
    async fn reject(self: Box<Self>, reason: &str);
}

/// An authenticated inbound connection.
///
/// All channels opened here are multiplexed over one underlying socket,
/// which is why the deadline applies to the connection as a whole.
#[async_trait]
pub trait TunnelConnection: Send + Sync + fmt::Debug {
    /// Open a new channel of the given type toward the peer.
    async fn open_channel(&self, channel_type: &str) -> WireResult<Box<dyn OutboundChannel>>;

    /// Address the peer connected from.
    fn remote_addr(&self) -> SocketAddr;

    /// Permissions attached when the connection was authorized.
    fn permissions(&self) -> &Permissions;

    /// Install or clear the I/O deadline for the whole connection.
    fn set_deadline(&self, deadline: Option<Instant>);

    /// Close the connection. Pending and future operations fail.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// An accepted connection that has not passed key authentication yet.
#[async_trait]
pub trait PendingConnection: Send {
    fn remote_addr(&self) -> SocketAddr;

    /// SSH user name the peer presented.
    fn user(&self) -> &str;

    /// Public key or certificate the peer presented, OpenSSH-encoded.
    fn presented_key(&self) -> &str;

    /// Finish the handshake, attaching the permissions produced by key
    /// authentication. Yields the live connection and its channel offers.
    async fn authorize(
        self: Box<Self>,
        permissions: Permissions,
    ) -> WireResult<(Arc<dyn TunnelConnection>, ChannelOffers)>;

    /// Abort the handshake with a reason reported to the peer.
    async fn reject(self: Box<Self>, reason: &str);
}

/// Server side: listens for inbound tunnel connections.
#[async_trait]
pub trait TunnelListener: Send + Sync + fmt::Debug {
    /// Accept the next inbound connection, pre-authentication.
    async fn accept(&self) -> WireResult<Box<dyn PendingConnection>>;

    fn local_addr(&self) -> SocketAddr;

    /// Stop accepting. Blocked and future `accept` calls fail with
    /// [`WireError::ListenerClosed`].
    async fn close(&self);
}

/// Authentication material for outbound SSH client handshakes.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    Password(String),
    PublicKey(ssh_key::PrivateKey),
}

/// Runs the outbound SSH client handshake over an already-dialed stream.
#[async_trait]
pub trait ClientHandshaker: Send + Sync {
    async fn handshake(
        &self,
        stream: Box<dyn ChannelStream>,
        addr: &str,
        user: &str,
        methods: &[AuthMethod],
    ) -> WireResult<Box<dyn SshClient>>;
}

/// An established outbound SSH client session.
#[async_trait]
pub trait SshClient: Send {
    /// Open a session channel on the client connection.
    async fn open_session(&mut self) -> WireResult<Box<dyn ChannelStream>>;

    async fn close(&mut self) -> WireResult<()>;
}
