//! Trust-store / control-plane client interface
//!
//! The relay consumes the cluster control plane through this trait: the
//! certificate authorities it trusts, by role, and the directory of
//! SSH-accessible servers inside the cluster. The local trust store and
//! the per-site clients built over tunnel transports both implement it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ssh_key::PublicKey;
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("control plane unavailable: {0}")]
    Unavailable(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Which certificate role a CA signs for. Host and user trust are
/// tracked through independent CA sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertRole {
    Host,
    User,
}

impl fmt::Display for CertRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertRole::Host => f.write_str("host"),
            CertRole::User => f.write_str("user"),
        }
    }
}

/// A certificate authority record: the authority domain it is bound to,
/// the role it signs for, and its ordered signer keys ("checkers").
#[derive(Debug, Clone)]
pub struct CertAuthority {
    domain: String,
    role: CertRole,
    checkers: Vec<PublicKey>,
}

impl CertAuthority {
    pub fn new(domain: impl Into<String>, role: CertRole, checkers: Vec<PublicKey>) -> Self {
        Self {
            domain: domain.into(),
            role,
            checkers,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn role(&self) -> CertRole {
        self.role
    }

    pub fn checkers(&self) -> &[PublicKey] {
        &self.checkers
    }
}

/// One entry of a cluster's server directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub hostname: String,
    pub addr: String,
}

/// Lookup interface to a cluster control plane.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Certificate authorities of the given role the cluster vouches for.
    async fn cert_authorities(&self, role: CertRole) -> Result<Vec<CertAuthority>, ClientError>;

    /// The cluster's SSH server directory.
    async fn servers(&self) -> Result<Vec<ServerEntry>, ClientError>;
}

/// In-memory [`ClusterClient`] for small deployments and tests.
#[derive(Debug, Default)]
pub struct StaticClusterClient {
    authorities: RwLock<Vec<CertAuthority>>,
    servers: RwLock<Vec<ServerEntry>>,
}

impl StaticClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_authority(&self, authority: CertAuthority) {
        self.authorities.write().unwrap().push(authority);
    }

    pub fn add_server(&self, entry: ServerEntry) {
        self.servers.write().unwrap().push(entry);
    }
}

#[async_trait]
impl ClusterClient for StaticClusterClient {
    async fn cert_authorities(&self, role: CertRole) -> Result<Vec<CertAuthority>, ClientError> {
        Ok(self
            .authorities
            .read()
            .unwrap()
            .iter()
            .filter(|ca| ca.role() == role)
            .cloned()
            .collect())
    }

    async fn servers(&self) -> Result<Vec<ServerEntry>, ClientError> {
        Ok(self.servers.read().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_client_filters_by_role() {
        let client = StaticClusterClient::new();
        client.add_authority(CertAuthority::new("east.example.com", CertRole::Host, vec![]));
        client.add_authority(CertAuthority::new("east.example.com", CertRole::User, vec![]));
        client.add_authority(CertAuthority::new("west.example.com", CertRole::Host, vec![]));

        let hosts = client.cert_authorities(CertRole::Host).await.unwrap();
        assert_eq!(hosts.len(), 2);
        assert!(hosts.iter().all(|ca| ca.role() == CertRole::Host));

        let users = client.cert_authorities(CertRole::User).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].domain(), "east.example.com");
    }

    #[tokio::test]
    async fn test_static_client_servers() {
        let client = StaticClusterClient::new();
        assert!(client.servers().await.unwrap().is_empty());

        client.add_server(ServerEntry {
            hostname: "node-1".to_string(),
            addr: "10.0.0.5:22".to_string(),
        });
        let servers = client.servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].hostname, "node-1");
    }
}
