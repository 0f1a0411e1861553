//! Reverse tunnel server
//!
//! Accepts inbound connections from remote agents, authenticates their
//! SSH certificates against the local trust store, routes heartbeat
//! channels into the site registry, and exposes the dispatcher API.

use crate::error::RelayError;
use crate::registry::SiteRegistry;
use crate::site::RemoteClientFactory;
use crate::RemoteSite;
use gridlink_auth::{AuthError, CertRole, ClusterClient, TrustEvaluator};
use gridlink_proto::{
    Permissions, CERT_TYPE_HOST, CERT_TYPE_USER, CHAN_HEARTBEAT, DEFAULT_SERVER_TIMEOUT,
    EXT_AUTHORITY, EXT_CERT_TYPE, EXT_HOST,
};
use gridlink_wire::{
    ChannelOffer, ClientHandshaker, PendingConnection, TunnelConnection, TunnelListener, WireError,
};
use ssh_key::certificate::CertType;
use ssh_key::Certificate;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Configuration for [`RelayServer`].
pub struct RelayConfig {
    timeout: Duration,
    remote_clients: Arc<dyn RemoteClientFactory>,
    handshaker: Arc<dyn ClientHandshaker>,
    direct_sites: Vec<(String, Arc<dyn ClusterClient>)>,
}

impl RelayConfig {
    pub fn new(
        remote_clients: Arc<dyn RemoteClientFactory>,
        handshaker: Arc<dyn ClientHandshaker>,
    ) -> Self {
        Self {
            timeout: DEFAULT_SERVER_TIMEOUT,
            remote_clients,
            handshaker,
            direct_sites: Vec::new(),
        }
    }

    /// Deadline applied to outbound operations on tunnel connections.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Proxy access to this site over the plain network instead of a
    /// reverse tunnel.
    pub fn with_direct_site(
        mut self,
        domain: impl Into<String>,
        client: Arc<dyn ClusterClient>,
    ) -> Self {
        self.direct_sites.push((domain.into(), client));
        self
    }
}

/// The reverse tunnel server.
pub struct RelayServer {
    inner: Arc<ServerInner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

struct ServerInner {
    listener: Arc<dyn TunnelListener>,
    registry: SiteRegistry,
    trust: TrustEvaluator,
}

impl RelayServer {
    /// Build an unstarted server over an already-bound listener.
    pub fn new(
        listener: Arc<dyn TunnelListener>,
        local_client: Arc<dyn ClusterClient>,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        let registry =
            SiteRegistry::new(config.timeout, config.remote_clients, config.handshaker);
        for (domain, client) in config.direct_sites {
            registry.add_direct_site(&domain, client)?;
        }
        Ok(Self {
            inner: Arc::new(ServerInner {
                listener,
                registry,
                trust: TrustEvaluator::new(local_client),
            }),
            accept_task: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.listener.local_addr()
    }

    /// Start accepting inbound tunnel connections.
    pub fn start(&self) -> Result<(), RelayError> {
        let mut task = self.accept_task.lock().unwrap();
        if task.is_some() {
            return Err(RelayError::Internal("server already started".to_string()));
        }
        *task = Some(tokio::spawn(accept_loop(Arc::clone(&self.inner))));
        Ok(())
    }

    /// Wait for the accept loop to finish. Returns immediately when the
    /// server was never started.
    pub async fn wait(&self) {
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Stop accepting new connections. Established tunnels live on.
    pub async fn close(&self) {
        self.inner.listener.close().await;
    }

    /// All connected and configured sites.
    pub fn sites(&self) -> Vec<Arc<dyn RemoteSite>> {
        self.inner.registry.sites()
    }

    /// The site registered under exactly this authority domain.
    pub fn site(&self, domain: &str) -> Result<Arc<dyn RemoteSite>, RelayError> {
        self.inner.registry.site(domain)
    }

    /// The site whose domain is most similar to `domain` (shared
    /// trailing labels), if any label matches at all.
    pub fn find_similar_site(&self, domain: &str) -> Result<Arc<dyn RemoteSite>, RelayError> {
        self.inner.registry.find_similar_site(domain)
    }
}

async fn accept_loop(inner: Arc<ServerInner>) {
    loop {
        match inner.listener.accept().await {
            Ok(pending) => {
                tokio::spawn(handle_connection(Arc::clone(&inner), pending));
            }
            Err(WireError::ListenerClosed) => {
                debug!("listener closed, stopping accept loop");
                break;
            }
            Err(err) => {
                warn!(error = %err, "failed to accept connection");
            }
        }
    }
}

async fn handle_connection(inner: Arc<ServerInner>, pending: Box<dyn PendingConnection>) {
    let remote = pending.remote_addr();
    let user = pending.user().to_string();
    debug!(%remote, %user, "key auth attempt");

    let permissions = match key_auth(&inner.trust, &user, pending.presented_key()).await {
        Ok(permissions) => permissions,
        Err(err) => {
            warn!(%remote, %user, error = %err, "authentication failed");
            pending.reject("authentication failed").await;
            return;
        }
    };

    let (conn, mut offers) = match pending.authorize(permissions).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(%remote, %user, error = %err, "failed to finish handshake");
            return;
        }
    };

    while let Some(offer) = offers.next().await {
        handle_new_channel(&inner, &conn, offer).await;
    }
    debug!(%remote, "connection closed");
}

async fn handle_new_channel(
    inner: &Arc<ServerInner>,
    conn: &Arc<dyn TunnelConnection>,
    offer: Box<dyn ChannelOffer>,
) {
    debug!(channel_type = offer.channel_type(), "new channel request");
    if offer.channel_type() != CHAN_HEARTBEAT {
        // Not ours to handle; dropping the offer lets the wire layer
        // refuse it.
        return;
    }

    match conn.permissions().get(EXT_CERT_TYPE) {
        Some(CERT_TYPE_HOST) => {
            let site = match inner.registry.upsert_tunnel_site(Arc::clone(conn)) {
                Ok(site) => site,
                Err(err) => {
                    error!(error = %err, "failed to upsert site");
                    offer.reject("failed to upsert site").await;
                    return;
                }
            };
            match offer.accept().await {
                Ok((stream, requests)) => {
                    let _ = site.spawn_heartbeat_drain(stream, requests);
                }
                Err(err) => {
                    error!(error = %err, "failed to accept heartbeat channel");
                    conn.close().await;
                }
            }
        }
        Some(CERT_TYPE_USER) => {
            // Ad-hoc user sessions are not part of this server.
            offer.reject("ad-hoc sessions are not supported").await;
        }
        _ => {
            offer.reject("failed to upsert site").await;
        }
    }
}

/// Authenticate a presented public key.
///
/// Only SSH certificates are accepted. Host certificates must name the
/// authority domain of their signing CA, and that CA must be trusted
/// under exactly that domain: a certificate signed by one trusted
/// cluster cannot claim to be another.
pub(crate) async fn key_auth(
    trust: &TrustEvaluator,
    user: &str,
    presented_key: &str,
) -> Result<Permissions, AuthError> {
    let cert = Certificate::from_openssh(presented_key).map_err(|_| {
        AuthError::BadParameter("unsupported key type, expected an SSH certificate".to_string())
    })?;

    match cert.cert_type() {
        CertType::Host => {
            let authority = cert
                .extensions()
                .iter()
                .find(|(name, _)| name.as_str() == EXT_AUTHORITY)
                .map(|(_, data)| data.as_str())
                .unwrap_or("");
            if authority.is_empty() {
                return Err(AuthError::BadParameter(
                    "certificate is missing the authority domain extension".to_string(),
                ));
            }
            trust.check_cert(CertRole::Host, user, &cert).await?;
            trust
                .check_trusted_key(CertRole::Host, authority, cert.signature_key())
                .await?;
            Ok(Permissions::new()
                .with_extension(EXT_HOST, user)
                .with_extension(EXT_CERT_TYPE, CERT_TYPE_HOST)
                .with_extension(EXT_AUTHORITY, authority))
        }
        CertType::User => {
            trust.check_cert(CertRole::User, user, &cert).await?;
            Ok(Permissions::new()
                .with_extension(EXT_HOST, user)
                .with_extension(EXT_CERT_TYPE, CERT_TYPE_USER))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridlink_auth::{CertAuthority, StaticClusterClient};
    use ssh_key::certificate::Builder;
    use ssh_key::rand_core::OsRng;
    use ssh_key::{Algorithm, PrivateKey};

    fn new_key() -> PrivateKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
    }

    fn host_cert(ca: &PrivateKey, principal: &str, authority: Option<&str>) -> String {
        let subject = new_key();
        let now = chrono::Utc::now().timestamp() as u64;
        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            subject.public_key().clone(),
            now - 60,
            now + 3600,
        )
        .unwrap();
        builder.cert_type(CertType::Host).unwrap();
        builder.valid_principal(principal).unwrap();
        if let Some(domain) = authority {
            builder.extension(EXT_AUTHORITY, domain).unwrap();
        }
        builder.sign(ca).unwrap().to_openssh().unwrap()
    }

    fn user_cert(ca: &PrivateKey, principal: &str) -> String {
        let subject = new_key();
        let now = chrono::Utc::now().timestamp() as u64;
        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            subject.public_key().clone(),
            now - 60,
            now + 3600,
        )
        .unwrap();
        builder.cert_type(CertType::User).unwrap();
        builder.valid_principal(principal).unwrap();
        builder.sign(ca).unwrap().to_openssh().unwrap()
    }

    fn trust_for(authorities: &[(&str, CertRole, &PrivateKey)]) -> TrustEvaluator {
        let client = Arc::new(StaticClusterClient::new());
        for (domain, role, key) in authorities {
            client.add_authority(CertAuthority::new(
                *domain,
                *role,
                vec![key.public_key().clone()],
            ));
        }
        TrustEvaluator::new(client)
    }

    #[tokio::test]
    async fn test_key_auth_accepts_trusted_host_cert() {
        let ca = new_key();
        let trust = trust_for(&[("east.example.com", CertRole::Host, &ca)]);
        let cert = host_cert(&ca, "node", Some("east.example.com"));

        let permissions = key_auth(&trust, "node", &cert).await.unwrap();
        assert_eq!(permissions.get(EXT_CERT_TYPE), Some(CERT_TYPE_HOST));
        assert_eq!(permissions.get(EXT_AUTHORITY), Some("east.example.com"));
        assert_eq!(permissions.get(EXT_HOST), Some("node"));
    }

    #[tokio::test]
    async fn test_key_auth_rejects_plain_key() {
        let ca = new_key();
        let trust = trust_for(&[("east.example.com", CertRole::Host, &ca)]);
        let plain = new_key().public_key().to_openssh().unwrap();

        let err = key_auth(&trust, "node", &plain).await.unwrap_err();
        assert!(matches!(err, AuthError::BadParameter(_)));
    }

    #[tokio::test]
    async fn test_key_auth_requires_authority_extension() {
        let ca = new_key();
        let trust = trust_for(&[("east.example.com", CertRole::Host, &ca)]);
        let cert = host_cert(&ca, "node", None);

        let err = key_auth(&trust, "node", &cert).await.unwrap_err();
        assert!(matches!(err, AuthError::BadParameter(_)));
    }

    #[tokio::test]
    async fn test_key_auth_rejects_spoofed_authority() {
        // The west CA is trusted, but its certificates cannot claim to
        // be the east cluster.
        let east_ca = new_key();
        let west_ca = new_key();
        let trust = trust_for(&[
            ("east.example.com", CertRole::Host, &east_ca),
            ("west.example.com", CertRole::Host, &west_ca),
        ]);
        let cert = host_cert(&west_ca, "node", Some("east.example.com"));

        let err = key_auth(&trust, "node", &cert).await.unwrap_err();
        assert!(matches!(err, AuthError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_key_auth_rejects_untrusted_signer() {
        let ca = new_key();
        let rogue = new_key();
        let trust = trust_for(&[("east.example.com", CertRole::Host, &ca)]);
        let cert = host_cert(&rogue, "node", Some("east.example.com"));

        let err = key_auth(&trust, "node", &cert).await.unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn test_key_auth_accepts_user_cert_without_authority() {
        let ca = new_key();
        let trust = trust_for(&[("east.example.com", CertRole::User, &ca)]);
        let cert = user_cert(&ca, "alice");

        let permissions = key_auth(&trust, "alice", &cert).await.unwrap();
        assert_eq!(permissions.get(EXT_CERT_TYPE), Some(CERT_TYPE_USER));
        assert_eq!(permissions.get(EXT_AUTHORITY), None);
    }
}
