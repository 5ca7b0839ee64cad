//! The certificate authority as seen by the lifecycle core: an opaque capability that can
//! register accounts and issue or renew certificates.

use crate::account::{Account, Registration};
use crate::certificate::{Certificate, CertificateResource, SigningRequest};
use async_trait::async_trait;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};

pub mod lego;

pub use lego::LegoAuthority;

/// Issuance failed for at least one requested domain.
///
/// A request for several domains is all-or-nothing: a single failed domain fails the whole
/// certificate, and nothing is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceFailure {
    pub failures: BTreeMap<String, String>,
}

impl IssuanceFailure {
    pub fn new(failures: BTreeMap<String, String>) -> Self {
        Self { failures }
    }

    /// The same failure reason for every domain, for errors that are not domain specific
    pub fn for_all<I, S>(domains: I, reason: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failures: domains
                .into_iter()
                .map(|domain| (domain.into(), reason.to_string()))
                .collect(),
        }
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.failures.keys().map(String::as_str)
    }
}

impl Display for IssuanceFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "certificate issuance failed for {}",
            self.failures
                .iter()
                .map(|(domain, reason)| format!("{domain} ({reason})"))
                .join(", ")
        )
    }
}

impl std::error::Error for IssuanceFailure {}

#[async_trait]
pub trait CertificateAuthority: Debug + Send + Sync {
    /// Create (or look up) the CA account for `account`'s key.
    async fn register(&self, account: &Account) -> anyhow::Result<Registration>;

    /// Agree to the CA's current terms of service on behalf of `account`.
    async fn agree_to_terms(&self, account: &Account) -> anyhow::Result<Registration>;

    /// Issue a certificate for `domains`. The first domain becomes the primary domain.
    async fn obtain(
        &self,
        account: &Account,
        domains: &[String],
        bundle: bool,
    ) -> Result<CertificateResource, IssuanceFailure>;

    /// Issue a certificate for an externally supplied signing request. The result carries
    /// no private key.
    async fn obtain_for_csr(
        &self,
        account: &Account,
        csr: &SigningRequest,
        bundle: bool,
    ) -> Result<CertificateResource, IssuanceFailure>;

    /// Re-issue `current` for the same identity (domains or signing request).
    async fn renew(
        &self,
        account: &Account,
        current: &Certificate,
        bundle: bool,
    ) -> anyhow::Result<CertificateResource>;
}
