//! A pooled inbound connection

use gridlink_wire::TunnelConnection;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// One live inbound connection owned by a site pool.
///
/// The `invalid` flag is monotonic: once set, the connection is never
/// handed out again and the next pool walk that crosses it evicts and
/// closes it. In-flight operations that already hold the connection run
/// to completion (or error) on their own.
#[derive(Debug)]
pub(crate) struct PooledConnection {
    conn: Arc<dyn TunnelConnection>,
    remote_addr: SocketAddr,
    invalid: AtomicBool,
    deadline_holds: AtomicI32,
}

impl PooledConnection {
    pub(crate) fn new(conn: Arc<dyn TunnelConnection>) -> Self {
        let remote_addr = conn.remote_addr();
        Self {
            conn,
            remote_addr,
            invalid: AtomicBool::new(false),
            deadline_holds: AtomicI32::new(0),
        }
    }

    pub(crate) fn conn(&self) -> &Arc<dyn TunnelConnection> {
        &self.conn
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Arm the connection deadline for one outbound operation.
    ///
    /// The deadline covers the whole underlying socket because every
    /// channel is multiplexed over it, so overlapping operations count
    /// their holds and only the last release clears it.
    pub(crate) fn set_deadline(&self, timeout: Duration) {
        self.deadline_holds.fetch_add(1, Ordering::SeqCst);
        self.conn.set_deadline(Some(Instant::now() + timeout));
    }

    /// Release one deadline hold. While other holds remain the deadline
    /// is left in place; those waiters just wait slightly longer than
    /// their own request asked for.
    pub(crate) fn reset_deadline(&self) {
        let remaining = self.deadline_holds.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            trace!(remote = %self.remote_addr, "clearing connection deadline");
            self.conn.set_deadline(None);
        } else {
            trace!(remote = %self.remote_addr, remaining, "deadline still held");
        }
    }

    pub(crate) fn mark_invalid(&self) {
        if !self.invalid.swap(true, Ordering::SeqCst) {
            debug!(remote = %self.remote_addr, "connection marked invalid");
        }
    }

    pub(crate) fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }

    pub(crate) async fn close(&self) {
        self.conn.close().await;
    }
}
