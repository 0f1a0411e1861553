//! Protocol constants and shared types for the gridlink reverse tunnel

pub mod domain;
pub mod permissions;

pub use domain::{is_valid_domain_name, trailing_label_similarity};
pub use permissions::Permissions;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Channel opened by the remote agent immediately after authentication.
/// Carries empty keepalive requests at the agent's chosen cadence.
pub const CHAN_HEARTBEAT: &str = "heartbeat";

/// Channel opened by the relay for each outbound dial into the remote
/// cluster. The opener sends a [`REQ_TRANSPORT_DIAL`] request before use.
pub const CHAN_TRANSPORT: &str = "transport";

/// Channel opened by the relay for control-plane API traffic. No dial
/// request; the remote end routes it to its local control plane.
pub const CHAN_ACCESS_POINT: &str = "access-point";

/// Request sent on a freshly opened transport channel. Payload is the
/// UTF-8 `host:port` target; the boolean reply is the remote agent's
/// judgment whether it can reach that target.
pub const REQ_TRANSPORT_DIAL: &str = "transport-dial";

/// Permission extension: the SSH user the peer authenticated as.
pub const EXT_HOST: &str = "host@gridlink";

/// Permission extension: which certificate role authenticated the peer.
pub const EXT_CERT_TYPE: &str = "certtype@gridlink";

/// Certificate and permission extension naming the authority domain of
/// the signing CA. Required on host certificates.
pub const EXT_AUTHORITY: &str = "authority@gridlink";

/// Value of [`EXT_CERT_TYPE`] for host certificates.
pub const CERT_TYPE_HOST: &str = "host";

/// Value of [`EXT_CERT_TYPE`] for user certificates.
pub const CERT_TYPE_USER: &str = "user";

/// Default deadline applied to outbound operations on a tunnel.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Expected cadence of agent keepalives. A site is reported offline once
/// no heartbeat has arrived for twice this period.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

/// Liveness of a remote site as derived from its heartbeat stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Online,
    Offline,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatus::Online => "online",
            SiteStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(SiteStatus::Online.to_string(), "online");
        assert_eq!(SiteStatus::Offline.to_string(), "offline");
    }
}
