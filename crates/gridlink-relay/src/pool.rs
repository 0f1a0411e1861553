//! Round-robin connection pool with lazy eviction

use crate::conn::PooledConnection;
use crate::error::RelayError;
use gridlink_proto::{CHAN_ACCESS_POINT, CHAN_TRANSPORT, REQ_TRANSPORT_DIAL};
use gridlink_wire::{ChannelStream, OutboundChannel, TunnelConnection, WireError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

/// Ordered pool of inbound connections for one site.
///
/// Picks are round-robin over arrival order; invalid entries are spliced
/// out during the walk and closed on a background task, so every pick
/// either returns a connection believed live or reports the pool empty.
#[derive(Debug)]
pub(crate) struct ConnectionPool {
    domain: String,
    timeout: Duration,
    state: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    conns: Vec<Arc<PooledConnection>>,
    cursor: usize,
}

/// Outcome of a single dial attempt over one picked connection.
enum DialAttempt {
    /// The tunnel itself failed; the pick is dead, try another.
    Tunnel(WireError),
    /// The tunnel is fine but the remote cannot reach the target.
    Unreachable,
}

impl ConnectionPool {
    pub(crate) fn new(domain: String, timeout: Duration) -> Self {
        Self {
            domain,
            timeout,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub(crate) fn add(&self, conn: Arc<dyn TunnelConnection>) {
        let mut state = self.state.lock().unwrap();
        state.conns.push(Arc::new(PooledConnection::new(conn)));
        state.cursor = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().conns.len()
    }

    /// Next connection believed live, evicting invalid entries on the way.
    pub(crate) fn next_conn(&self) -> Result<Arc<PooledConnection>, RelayError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.conns.is_empty() {
                return Err(RelayError::NotFound("no active connections".to_string()));
            }
            state.cursor = (state.cursor + 1) % state.conns.len();
            let picked = Arc::clone(&state.conns[state.cursor]);
            if !picked.is_invalid() {
                trace!(domain = %self.domain, index = state.cursor, "picked pool connection");
                return Ok(picked);
            }
            let index = state.cursor;
            state.conns.remove(index);
            state.cursor = 0;
            debug!(domain = %self.domain, remote = %picked.remote_addr(), "evicting invalid connection");
            // Physical close must not run under the pool lock.
            tokio::spawn(async move { picked.close().await });
        }
    }

    /// Open a transport channel directed at `addr`.
    ///
    /// Tunnel-side failures invalidate the pick and retry with a fresh
    /// one until the pool runs dry; a `false` dial reply means the remote
    /// cannot reach the target and is terminal.
    pub(crate) async fn dial(&self, addr: &str) -> Result<Box<dyn ChannelStream>, RelayError> {
        loop {
            let conn = self.next_conn()?;
            conn.set_deadline(self.timeout);
            let attempt = open_transport(&conn, addr).await;
            conn.reset_deadline();
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(DialAttempt::Tunnel(err)) => {
                    conn.mark_invalid();
                    debug!(
                        domain = %self.domain,
                        remote = %conn.remote_addr(),
                        error = %err,
                        "transport dial failed, retrying on another connection"
                    );
                }
                Err(DialAttempt::Unreachable) => {
                    return Err(RelayError::ConnectionProblem(format!(
                        "remote server {addr} is not available"
                    )));
                }
            }
        }
    }

    /// Open an access-point channel for control-plane traffic. No dial
    /// directive is sent; the remote routes it to its local control
    /// plane.
    pub(crate) async fn dial_access_point(&self) -> Result<Box<dyn ChannelStream>, RelayError> {
        loop {
            let conn = self.next_conn()?;
            conn.set_deadline(self.timeout);
            let attempt = conn.conn().open_channel(CHAN_ACCESS_POINT).await;
            conn.reset_deadline();
            match attempt {
                Ok(channel) => return Ok(channel.into_stream()),
                Err(err) => {
                    conn.mark_invalid();
                    debug!(
                        domain = %self.domain,
                        remote = %conn.remote_addr(),
                        error = %err,
                        "access point dial failed, retrying on another connection"
                    );
                }
            }
        }
    }
}

async fn open_transport(
    conn: &PooledConnection,
    addr: &str,
) -> Result<Box<dyn ChannelStream>, DialAttempt> {
    let mut channel = conn
        .conn()
        .open_channel(CHAN_TRANSPORT)
        .await
        .map_err(DialAttempt::Tunnel)?;
    let dialed = channel
        .request(REQ_TRANSPORT_DIAL, true, addr.as_bytes())
        .await
        .map_err(DialAttempt::Tunnel)?;
    if !dialed {
        return Err(DialAttempt::Unreachable);
    }
    Ok(channel.into_stream())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::StubConnection;

    fn pool_with(addrs: &[&str]) -> (ConnectionPool, Vec<Arc<StubConnection>>) {
        let pool = ConnectionPool::new("east.example.com".to_string(), Duration::from_secs(30));
        let stubs: Vec<Arc<StubConnection>> = addrs
            .iter()
            .map(|addr| Arc::new(StubConnection::new(addr)))
            .collect();
        for stub in &stubs {
            pool.add(stub.clone());
        }
        (pool, stubs)
    }

    #[tokio::test]
    async fn test_empty_pool_is_not_found() {
        let (pool, _) = pool_with(&[]);
        let err = pool.next_conn().unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_round_robin_order() {
        let (pool, _stubs) = pool_with(&["10.0.0.1:1", "10.0.0.2:2", "10.0.0.3:3"]);

        // The cursor advances before each pick, so the walk starts at
        // index 1 and wraps.
        let picks: Vec<String> = (0..4)
            .map(|_| pool.next_conn().unwrap().remote_addr().to_string())
            .collect();
        assert_eq!(picks, ["10.0.0.2:2", "10.0.0.3:3", "10.0.0.1:1", "10.0.0.2:2"]);
    }

    #[tokio::test]
    async fn test_invalid_connections_are_evicted_in_one_walk() {
        let (pool, _stubs) = pool_with(&["10.0.0.1:1", "10.0.0.2:2", "10.0.0.3:3"]);

        for _ in 0..3 {
            pool.next_conn().unwrap().mark_invalid();
        }
        let err = pool.next_conn().unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn test_eviction_skips_to_live_connection() {
        let (pool, _stubs) = pool_with(&["10.0.0.1:1", "10.0.0.2:2"]);

        // First pick lands on index 1; kill it and expect the survivor.
        let first = pool.next_conn().unwrap();
        assert_eq!(first.remote_addr().to_string(), "10.0.0.2:2");
        first.mark_invalid();

        let survivor = pool.next_conn().unwrap();
        assert_eq!(survivor.remote_addr().to_string(), "10.0.0.1:1");
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_add_resets_cursor() {
        let (pool, _stubs) = pool_with(&["10.0.0.1:1", "10.0.0.2:2"]);
        let _ = pool.next_conn().unwrap();

        pool.add(Arc::new(StubConnection::new("10.0.0.3:3")));
        // Cursor restarts at 0, so the next pick is index 1 again.
        let pick = pool.next_conn().unwrap();
        assert_eq!(pick.remote_addr().to_string(), "10.0.0.2:2");
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn test_dial_with_empty_pool_surfaces_not_found() {
        let (pool, _) = pool_with(&[]);
        let err = pool.dial("10.0.0.5:22").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_dial_exhausts_failing_pool() {
        // Stub connections refuse to open channels, so every pick is
        // invalidated in turn and the dial ends with pool exhaustion.
        let (pool, _stubs) = pool_with(&["10.0.0.1:1", "10.0.0.2:2"]);
        let err = pool.dial("10.0.0.5:22").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(pool.len(), 0);
    }
}
