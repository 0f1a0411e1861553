//! Error taxonomy of the relay

use gridlink_auth::ClientError;
use gridlink_wire::WireError;
use thiserror::Error;

/// Errors surfaced by the dispatcher and dial operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed input: wrong certificate type, invalid domain name.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// No such site, or no live connection left to serve a dial.
    #[error("not found: {0}")]
    NotFound(String),

    /// Authentication failed.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The remote reported the target unreachable, or tunnel I/O failed.
    #[error("connection problem: {0}")]
    ConnectionProblem(String),

    /// A site with this domain is already registered.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RelayError::NotFound(_))
    }

    pub fn is_connection_problem(&self) -> bool {
        matches!(self, RelayError::ConnectionProblem(_))
    }
}

impl From<WireError> for RelayError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::AccessDenied(reason) => RelayError::AccessDenied(reason),
            other => RelayError::ConnectionProblem(other.to_string()),
        }
    }
}

impl From<ClientError> for RelayError {
    fn from(err: ClientError) -> Self {
        RelayError::ConnectionProblem(format!("control plane request failed: {err}"))
    }
}
