//! Reverse tunnel server for the gridlink access platform
//!
//! Remote clusters ("sites") behind NAT dial out to this relay and keep
//! the connection open; the relay authenticates them with SSH
//! certificates, pools the inbound tunnels per authority domain, and
//! uses them as the transport for outbound dials back into each cluster
//! and for control-plane traffic.
//!
//! The SSH engine itself sits behind the `gridlink-wire` traits; the
//! trust store behind `gridlink-auth`'s [`ClusterClient`].

pub mod direct;
pub mod error;
pub mod registry;
pub mod server;
pub mod site;

mod conn;
mod pool;

#[cfg(test)]
mod testutil;

pub use direct::DirectSite;
pub use error::RelayError;
pub use registry::SiteRegistry;
pub use server::{RelayConfig, RelayServer};
pub use site::{AccessPointDialer, RemoteClientFactory, StaticRemoteClients, TunnelSite};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridlink_auth::ClusterClient;
use gridlink_proto::SiteStatus;
use gridlink_wire::{AuthMethod, ChannelStream, SshClient};
use std::sync::Arc;

/// A remote site reachable from this relay, either through its pool of
/// reverse tunnels or directly over the network.
#[async_trait]
pub trait RemoteSite: Send + Sync {
    /// Site name: the authority domain of the cluster.
    fn name(&self) -> &str;

    /// Liveness derived from the heartbeat stream.
    fn status(&self) -> SiteStatus;

    /// Wall-clock time the site was last seen connected.
    fn last_connected(&self) -> Option<DateTime<Utc>>;

    /// Control-plane client for the remote cluster.
    fn client(&self) -> Arc<dyn ClusterClient>;

    /// Dial any address within reach of the remote cluster's servers.
    async fn dial(&self, network: &str, addr: &str) -> Result<Box<dyn ChannelStream>, RelayError>;

    /// Dial a server listed in the cluster's directory.
    async fn dial_server(&self, addr: &str) -> Result<Box<dyn ChannelStream>, RelayError>;

    /// SSH into a server of the remote cluster.
    async fn connect_to_server(
        &self,
        addr: &str,
        user: &str,
        methods: &[AuthMethod],
    ) -> Result<Box<dyn SshClient>, RelayError>;
}

impl std::fmt::Debug for dyn RemoteSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RemoteSite").field(&self.name()).finish()
    }
}
