//! Certificate-authority trust for the gridlink reverse tunnel
//!
//! Remote clusters authenticate with SSH certificates. This crate holds
//! the lookup interface to the local trust store ([`ClusterClient`]) and
//! the [`TrustEvaluator`] that decides whether a presented certificate
//! was signed by a CA the store vouches for, including the domain-scoped
//! check that stops one trusted cluster from posing as another.

pub mod client;
pub mod trust;

pub use client::{
    CertAuthority, CertRole, ClientError, ClusterClient, ServerEntry, StaticClusterClient,
};
pub use trust::{AuthError, TrustEvaluator};
