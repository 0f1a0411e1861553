//! Stub wire connection shared by the unit tests

use async_trait::async_trait;
use gridlink_proto::Permissions;
use gridlink_wire::{OutboundChannel, TunnelConnection, WireError, WireResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

/// A wire connection that records deadline changes and refuses to open
/// channels.
#[derive(Debug)]
pub(crate) struct StubConnection {
    remote_addr: SocketAddr,
    permissions: Permissions,
    deadline: Mutex<Option<Instant>>,
    closed: AtomicBool,
}

impl StubConnection {
    pub(crate) fn new(addr: &str) -> Self {
        Self::with_permissions(addr, Permissions::new())
    }

    pub(crate) fn with_permissions(addr: &str, permissions: Permissions) -> Self {
        Self {
            remote_addr: addr.parse().unwrap(),
            permissions,
            deadline: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn last_deadline(&self) -> Option<Instant> {
        *self.deadline.lock().unwrap()
    }
}

#[async_trait]
impl TunnelConnection for StubConnection {
    async fn open_channel(&self, _channel_type: &str) -> WireResult<Box<dyn OutboundChannel>> {
        Err(WireError::ConnectionClosed)
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock().unwrap() = deadline;
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
