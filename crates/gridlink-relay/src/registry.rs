//! Site registry and dispatcher operations
//!
//! Process-wide map from authority domain to site, guarded by a
//! read-write lock: dispatcher lookups proceed in parallel, site
//! creation and connection attachment serialize. At most one site exists
//! per domain across the tunnel and direct lists.

use crate::direct::DirectSite;
use crate::error::RelayError;
use crate::site::{RemoteClientFactory, TunnelSite};
use crate::RemoteSite;
use gridlink_auth::ClusterClient;
use gridlink_proto::{is_valid_domain_name, trailing_label_similarity, EXT_AUTHORITY};
use gridlink_wire::{ClientHandshaker, TunnelConnection};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

pub struct SiteRegistry {
    state: RwLock<RegistryState>,
    timeout: Duration,
    remote_clients: Arc<dyn RemoteClientFactory>,
    handshaker: Arc<dyn ClientHandshaker>,
}

#[derive(Default)]
struct RegistryState {
    tunnel_sites: Vec<Arc<TunnelSite>>,
    direct_sites: Vec<Arc<DirectSite>>,
}

impl SiteRegistry {
    pub(crate) fn new(
        timeout: Duration,
        remote_clients: Arc<dyn RemoteClientFactory>,
        handshaker: Arc<dyn ClientHandshaker>,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            timeout,
            remote_clients,
            handshaker,
        }
    }

    /// Register a site reached over the plain network instead of a
    /// reverse tunnel.
    pub(crate) fn add_direct_site(
        &self,
        domain: &str,
        client: Arc<dyn ClusterClient>,
    ) -> Result<(), RelayError> {
        if !is_valid_domain_name(domain) {
            return Err(RelayError::BadParameter(format!(
                "'{domain}' is not a valid domain name"
            )));
        }
        let mut state = self.state.write().unwrap();
        if state.contains(domain) {
            return Err(RelayError::AlreadyExists(format!(
                "site '{domain}' is already registered"
            )));
        }
        state.direct_sites.push(Arc::new(DirectSite::new(
            domain,
            client,
            Arc::clone(&self.handshaker),
        )));
        info!(domain, "registered direct site");
        Ok(())
    }

    /// Find or create the tunnel site for the connection's authority
    /// domain and attach the connection to its pool.
    ///
    /// The write lock makes the find-and-attach pair atomic: two
    /// simultaneous connections from one domain become two entries in
    /// the same pool.
    pub(crate) fn upsert_tunnel_site(
        &self,
        conn: Arc<dyn TunnelConnection>,
    ) -> Result<Arc<TunnelSite>, RelayError> {
        let domain = conn
            .permissions()
            .get(EXT_AUTHORITY)
            .unwrap_or_default()
            .to_string();
        if !is_valid_domain_name(&domain) {
            return Err(RelayError::BadParameter(format!(
                "'{domain}' is not a valid authority domain"
            )));
        }

        let mut state = self.state.write().unwrap();
        if state.direct_sites.iter().any(|s| s.name() == domain) {
            return Err(RelayError::AlreadyExists(format!(
                "site '{domain}' is configured for direct dialing"
            )));
        }

        let site = match state.tunnel_sites.iter().find(|s| s.name() == domain) {
            Some(site) => {
                debug!(%domain, "found existing tunnel site");
                Arc::clone(site)
            }
            None => {
                let site = TunnelSite::new(
                    domain.clone(),
                    self.timeout,
                    self.remote_clients.as_ref(),
                    Arc::clone(&self.handshaker),
                );
                state.tunnel_sites.push(Arc::clone(&site));
                info!(%domain, "registered new tunnel site");
                site
            }
        };
        site.attach(conn);
        Ok(site)
    }

    /// All sites, tunnel sites first, in registration order.
    pub fn sites(&self) -> Vec<Arc<dyn RemoteSite>> {
        let state = self.state.read().unwrap();
        state
            .tunnel_sites
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn RemoteSite>)
            .chain(
                state
                    .direct_sites
                    .iter()
                    .map(|s| Arc::clone(s) as Arc<dyn RemoteSite>),
            )
            .collect()
    }

    /// Exact-match lookup, tunnel sites before direct sites.
    pub fn site(&self, domain: &str) -> Result<Arc<dyn RemoteSite>, RelayError> {
        let state = self.state.read().unwrap();
        if let Some(site) = state.tunnel_sites.iter().find(|s| s.name() == domain) {
            return Ok(Arc::clone(site) as Arc<dyn RemoteSite>);
        }
        if let Some(site) = state.direct_sites.iter().find(|s| s.name() == domain) {
            return Ok(Arc::clone(site) as Arc<dyn RemoteSite>);
        }
        Err(RelayError::NotFound(format!("site '{domain}' not found")))
    }

    /// Fuzzy lookup: the site sharing the most trailing domain labels
    /// with `domain` wins; ties go to the first site encountered. A site
    /// must share at least the top label to match at all.
    pub fn find_similar_site(&self, domain: &str) -> Result<Arc<dyn RemoteSite>, RelayError> {
        let sites = self.sites();

        let mut best: Option<usize> = None;
        let mut best_similarity = 0;
        for (index, site) in sites.iter().enumerate() {
            let similarity = trailing_label_similarity(domain, site.name());
            if similarity > best_similarity {
                best_similarity = similarity;
                best = Some(index);
            }
        }

        match best {
            Some(index) => Ok(Arc::clone(&sites[index])),
            None => Err(RelayError::NotFound(format!(
                "no site matching '{domain}' found"
            ))),
        }
    }
}

impl RegistryState {
    fn contains(&self, domain: &str) -> bool {
        self.tunnel_sites.iter().any(|s| s.name() == domain)
            || self.direct_sites.iter().any(|s| s.name() == domain)
    }
}
