//! Direct (tunnel-less) site
//!
//! A site the relay is configured to reach over the plain network stack.
//! Same dispatcher contract as a tunnel site; dials never touch a pool.

use crate::error::RelayError;
use crate::site::find_server;
use crate::RemoteSite;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridlink_auth::ClusterClient;
use gridlink_proto::SiteStatus;
use gridlink_wire::{AuthMethod, ChannelStream, ClientHandshaker, SshClient};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

pub struct DirectSite {
    domain: String,
    client: Arc<dyn ClusterClient>,
    handshaker: Arc<dyn ClientHandshaker>,
}

impl DirectSite {
    pub(crate) fn new(
        domain: &str,
        client: Arc<dyn ClusterClient>,
        handshaker: Arc<dyn ClientHandshaker>,
    ) -> Self {
        Self {
            domain: domain.to_string(),
            client,
            handshaker,
        }
    }
}

#[async_trait]
impl RemoteSite for DirectSite {
    fn name(&self) -> &str {
        &self.domain
    }

    fn status(&self) -> SiteStatus {
        // No heartbeat stream to age a direct site out.
        SiteStatus::Online
    }

    fn last_connected(&self) -> Option<DateTime<Utc>> {
        Some(Utc::now())
    }

    fn client(&self) -> Arc<dyn ClusterClient> {
        Arc::clone(&self.client)
    }

    async fn dial(
        &self,
        network: &str,
        addr: &str,
    ) -> Result<Box<dyn ChannelStream>, RelayError> {
        debug!(domain = %self.domain, network, addr, "dialing directly");
        let stream = TcpStream::connect(addr).await.map_err(|err| {
            RelayError::ConnectionProblem(format!("failed to dial {addr}: {err}"))
        })?;
        Ok(Box::new(stream))
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
        debug!(domain = %self.domain, addr, user, "connecting to server directly");
        let stream = self.dial("tcp", addr).await?;
        let client = self.handshaker.handshake(stream, addr, user, methods).await?;
        Ok(client)
    }
}
