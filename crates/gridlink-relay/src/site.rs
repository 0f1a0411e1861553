//! Tunnel-backed site
//!
//! A site is the relay-side representation of one remote cluster: the
//! pool of live inbound connections from it, the heartbeat-driven
//! liveness state, and a site-scoped control-plane client whose
//! transport dials through the pool.

use crate::error::RelayError;
use crate::pool::ConnectionPool;
use crate::RemoteSite;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridlink_auth::{ClusterClient, ServerEntry};
use gridlink_proto::{SiteStatus, HEARTBEAT_PERIOD};
use gridlink_wire::{
    AuthMethod, ChannelStream, ClientHandshaker, RequestStream, SshClient, TunnelConnection,
};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Builds the control-plane client for a freshly created site.
///
/// The dialer handed in routes through the site's tunnel pool, so the
/// resulting client reaches the remote cluster's control plane without
/// ever seeing the underlying transport.
pub trait RemoteClientFactory: Send + Sync {
    fn build(&self, dialer: AccessPointDialer) -> Arc<dyn ClusterClient>;
}

/// Factory that hands every site the same fixed client. For deployments
/// whose control planes are reachable out of band, and for tests.
pub struct StaticRemoteClients(pub Arc<dyn ClusterClient>);

impl RemoteClientFactory for StaticRemoteClients {
    fn build(&self, _dialer: AccessPointDialer) -> Arc<dyn ClusterClient> {
        Arc::clone(&self.0)
    }
}

/// Dial handle given to a site's control-plane client.
#[derive(Clone)]
pub struct AccessPointDialer {
    pool: Arc<ConnectionPool>,
}

impl AccessPointDialer {
    /// Open a control-plane stream over the site's tunnel pool.
    pub async fn dial(&self) -> Result<Box<dyn ChannelStream>, RelayError> {
        self.pool.dial_access_point().await
    }
}

struct Liveness {
    seen: Instant,
    seen_wall: DateTime<Utc>,
}

/// A site reached through reverse tunnels.
pub struct TunnelSite {
    domain: String,
    pool: Arc<ConnectionPool>,
    liveness: RwLock<Option<Liveness>>,
    client: Arc<dyn ClusterClient>,
    handshaker: Arc<dyn ClientHandshaker>,
}

impl std::fmt::Debug for TunnelSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TunnelSite").field(&self.domain).finish()
    }
}

impl TunnelSite {
    pub(crate) fn new(
        domain: String,
        timeout: Duration,
        remote_clients: &dyn RemoteClientFactory,
        handshaker: Arc<dyn ClientHandshaker>,
    ) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool::new(domain.clone(), timeout));
        let client = remote_clients.build(AccessPointDialer {
            pool: Arc::clone(&pool),
        });
        Arc::new(Self {
            domain,
            pool,
            liveness: RwLock::new(None),
            client,
            handshaker,
        })
    }

    /// Attach a freshly authenticated inbound connection to the pool.
    pub(crate) fn attach(&self, conn: Arc<dyn TunnelConnection>) {
        debug!(domain = %self.domain, remote = %conn.remote_addr(), "attaching tunnel connection");
        self.pool.add(conn);
    }

    /// Number of live connections currently pooled for this site.
    pub fn connection_count(&self) -> usize {
        self.pool.len()
    }

    fn touch(&self) {
        *self.liveness.write().unwrap() = Some(Liveness {
            seen: Instant::now(),
            seen_wall: Utc::now(),
        });
    }

    /// Drain keepalive requests off an accepted heartbeat channel,
    /// updating liveness until the agent side goes away. The connection
    /// itself is reaped lazily by the pool once something marks it
    /// invalid.
    pub(crate) fn spawn_heartbeat_drain(
        self: &Arc<Self>,
        stream: Box<dyn ChannelStream>,
        mut requests: RequestStream,
    ) -> JoinHandle<()> {
        let site = Arc::clone(self);
        tokio::spawn(async move {
            // Holding the stream keeps the channel open while draining.
            let _stream = stream;
            while let Some(_request) = requests.next().await {
                trace!(domain = %site.domain, "heartbeat");
                site.touch();
            }
            debug!(domain = %site.domain, "agent disconnected");
        })
    }
}

#[async_trait]
impl RemoteSite for TunnelSite {
    fn name(&self) -> &str {
        &self.domain
    }

    fn status(&self) -> SiteStatus {
        let liveness = self.liveness.read().unwrap();
        match liveness.as_ref() {
            Some(l) if Instant::now().duration_since(l.seen) <= 2 * HEARTBEAT_PERIOD => {
                SiteStatus::Online
            }
            _ => SiteStatus::Offline,
        }
    }

    fn last_connected(&self) -> Option<DateTime<Utc>> {
        self.liveness.read().unwrap().as_ref().map(|l| l.seen_wall)
    }

    fn client(&self) -> Arc<dyn ClusterClient> {
        Arc::clone(&self.client)
    }

    async fn dial(
        &self,
        network: &str,
        addr: &str,
    ) -> Result<Box<dyn ChannelStream>, RelayError> {
        debug!(domain = %self.domain, network, addr, "dialing through tunnel pool");
        self.pool.dial(addr).await
    }

    async fn dial_server(&self, addr: &str) -> Result<Box<dyn ChannelStream>, RelayError> {
        let servers = self.client.servers().await?;
        let entry = find_server(addr, &servers).ok_or_else(|| {
            RelayError::NotFound(format!("no server matching '{addr}' found"))
        })?;
        let target = entry.addr.clone();
        self.dial("tcp", &target).await
    }

    async fn connect_to_server(
        &self,
        addr: &str,
        user: &str,
        methods: &[AuthMethod],
    ) -> Result<Box<dyn SshClient>, RelayError> {
        debug!(domain = %self.domain, addr, user, "connecting to remote server");
        let stream = self.pool.dial(addr).await?;
        let client = self.handshaker.handshake(stream, addr, user, methods).await?;
        Ok(client)
    }
}

/// Resolve an address against a cluster's server directory: exact
/// address match first, then hostname against the host part.
pub(crate) fn find_server<'a>(addr: &str, servers: &'a [ServerEntry]) -> Option<&'a ServerEntry> {
    if let Some(entry) = servers.iter().find(|s| s.addr == addr) {
        return Some(entry);
    }
    let host = addr.split(':').next().unwrap_or(addr);
    servers.iter().find(|s| s.hostname == host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::StubConnection;
    use gridlink_auth::StaticClusterClient;
    use gridlink_wire::mem::PlainHandshaker;

    fn test_site() -> Arc<TunnelSite> {
        TunnelSite::new(
            "east.example.com".to_string(),
            Duration::from_secs(30),
            &StaticRemoteClients(Arc::new(StaticClusterClient::new())),
            Arc::new(PlainHandshaker),
        )
    }

    #[tokio::test]
    async fn test_site_without_heartbeats_is_offline() {
        let site = test_site();
        assert_eq!(site.status(), SiteStatus::Offline);
        assert!(site.last_connected().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_follows_heartbeat_age() {
        let site = test_site();
        site.touch();
        assert_eq!(site.status(), SiteStatus::Online);

        tokio::time::advance(2 * HEARTBEAT_PERIOD).await;
        assert_eq!(site.status(), SiteStatus::Online);

        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(site.status(), SiteStatus::Offline);
        assert!(site.last_connected().is_some());
    }

    #[tokio::test]
    async fn test_attach_grows_pool() {
        let site = test_site();
        assert_eq!(site.connection_count(), 0);
        site.attach(Arc::new(StubConnection::new("10.0.0.1:40000")));
        site.attach(Arc::new(StubConnection::new("10.0.0.1:40001")));
        assert_eq!(site.connection_count(), 2);
    }

    #[test]
    fn test_find_server_matches_addr_then_hostname() {
        let servers = vec![
            ServerEntry {
                hostname: "node-1".to_string(),
                addr: "10.0.0.5:22".to_string(),
            },
            ServerEntry {
                hostname: "node-2".to_string(),
                addr: "10.0.0.6:22".to_string(),
            },
        ];

        assert_eq!(
            find_server("10.0.0.6:22", &servers).unwrap().hostname,
            "node-2"
        );
        assert_eq!(
            find_server("node-1:22", &servers).unwrap().addr,
            "10.0.0.5:22"
        );
        assert!(find_server("node-3:22", &servers).is_none());
    }
}
