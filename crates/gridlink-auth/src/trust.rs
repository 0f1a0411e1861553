//! Trust evaluation for presented certificates
//!
//! SSH certificates carry only a signer public key, not a chain. The
//! evaluator therefore answers two separate questions: is the signer one
//! of our trusted CAs at all (the standard check), and is it trusted
//! *under the specific authority domain the peer claims* (the
//! anti-spoofing check). Without the second, any mutual-trust federation
//! collapses to global trust.

use crate::client::{CertRole, ClientError, ClusterClient};
use ssh_key::public::KeyData;
use ssh_key::{Certificate, Fingerprint, HashAlg, PublicKey};
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

/// Trust evaluation errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("trust store error: {0}")]
    Client(#[from] ClientError),
}

/// Stateless evaluator over the trust store.
pub struct TrustEvaluator {
    client: Arc<dyn ClusterClient>,
}

impl TrustEvaluator {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Whether `key` is a signer key of any trusted host CA.
    /// Fails closed when the trust store cannot be read.
    pub async fn is_host_authority(&self, key: &PublicKey) -> bool {
        self.is_authority(CertRole::Host, key).await
    }

    /// Whether `key` is a signer key of any trusted user CA.
    /// Fails closed when the trust store cannot be read.
    pub async fn is_user_authority(&self, key: &PublicKey) -> bool {
        self.is_authority(CertRole::User, key).await
    }

    async fn is_authority(&self, role: CertRole, key: &PublicKey) -> bool {
        let keys = match self.trusted_ca_keys(role).await {
            Ok(keys) => keys,
            Err(err) => {
                error!(%role, error = %err, "failed to retrieve trusted keys");
                return false;
            }
        };
        keys.iter().any(|k| k.key_data() == key.key_data())
    }

    /// All signer keys of the trusted CAs of `role`, flattened in CA
    /// order.
    pub async fn trusted_ca_keys(&self, role: CertRole) -> Result<Vec<PublicKey>, AuthError> {
        let authorities = self.client.cert_authorities(role).await?;
        Ok(authorities
            .iter()
            .flat_map(|ca| ca.checkers().iter().cloned())
            .collect())
    }

    /// Whether `key` is a signer key of a trusted CA of `role` bound to
    /// exactly `domain`.
    pub async fn check_trusted_key(
        &self,
        role: CertRole,
        domain: &str,
        key: &KeyData,
    ) -> Result<(), AuthError> {
        let authorities = self.client.cert_authorities(role).await?;
        for ca in &authorities {
            if ca.domain() != domain {
                continue;
            }
            if ca.checkers().iter().any(|c| c.key_data() == key) {
                return Ok(());
            }
        }
        Err(AuthError::NotFound(format!(
            "authority domain {domain} not found or has no matching keys"
        )))
    }

    /// Standard certificate checks: signed by a trusted CA of `role`,
    /// inside its validity window, and valid for the presented principal
    /// (an empty principal list means any).
    pub async fn check_cert(
        &self,
        role: CertRole,
        user: &str,
        cert: &Certificate,
    ) -> Result<(), AuthError> {
        let keys = self.trusted_ca_keys(role).await?;
        let fingerprints: Vec<Fingerprint> = keys
            .iter()
            .map(|k| k.fingerprint(HashAlg::Sha256))
            .collect();

        let now = chrono::Utc::now().timestamp().max(0) as u64;
        cert.validate_at(now, fingerprints.iter())
            .map_err(|err| AuthError::AccessDenied(format!("certificate validation failed: {err}")))?;

        let principals = cert.valid_principals();
        if !principals.is_empty() && !principals.iter().any(|p| p.as_str() == user) {
            return Err(AuthError::AccessDenied(format!(
                "certificate not valid for principal {user}"
            )));
        }
        Ok(())
    }
}
