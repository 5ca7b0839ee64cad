//! Certificate Record Store: certificate material keyed by primary domain.

use crate::account::{Account, parse_private_key};
use crate::authority::CertificateAuthority;
use crate::error::{RecordError, RecordResult};
use crate::store::{KeyLayout, KeyValueStore};
use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use url::Url;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;

const CSR_PEM_TAGS: [&str; 2] = ["CERTIFICATE REQUEST", "NEW CERTIFICATE REQUEST"];

/// Structured data stored next to the certificate (`{domain}.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateMetadata {
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_stable_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_ref: Option<String>,
    /// Issuer chain (PEM), when issued without bundling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_certificate: Option<String>,
    /// The signing request (PEM) the certificate was issued for, if it came from one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csr: Option<String>,
}

/// Certificate material as handed out by the certificate authority.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateResource {
    pub metadata: CertificateMetadata,
    /// Leaf certificate (PEM), followed by the issuer chain when bundled
    pub certificate: String,
    /// Private key (PEM). Absent for certificates issued for an external signing request.
    pub private_key: Option<String>,
}

impl Debug for CertificateResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateResource")
            .field("metadata", &self.metadata)
            .field("certificate", &self.certificate)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// An externally supplied certificate signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    der: Vec<u8>,
    domains: Vec<String>,
}

impl SigningRequest {
    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Reading signing request {} failed", path.display()))?;
        Self::from_bytes(&bytes)
            .with_context(|| format!("Parsing signing request {} failed", path.display()))
    }

    /// Accepts a PEM `CERTIFICATE REQUEST` block or raw DER.
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let der = if bytes.trim_ascii_start().starts_with(b"-----BEGIN") {
            pem::parse_many(bytes)
                .context("Reading PEM blocks failed")?
                .into_iter()
                .find(|block| CSR_PEM_TAGS.contains(&block.tag()))
                .ok_or_else(|| anyhow!("no CERTIFICATE REQUEST PEM block found"))?
                .into_contents()
        } else {
            bytes.to_vec()
        };
        let domains = csr_domains(&der)?;
        if domains.is_empty() {
            bail!("signing request names no domain");
        }
        Ok(Self { der, domains })
    }

    /// Subject common name first, then DNS subject alternative names, without duplicates
    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> String {
        pem::Pem::new("CERTIFICATE REQUEST", self.der.clone()).to_string()
    }
}

fn csr_domains(der: &[u8]) -> anyhow::Result<Vec<String>> {
    let (_, csr) = X509CertificationRequest::from_der(der)
        .map_err(|e| anyhow!("Decoding signing request failed: {e}"))?;
    let mut domains: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !domains.iter().any(|known| known == name) {
            domains.push(name.to_string());
        }
    };
    for cn in csr.certification_request_info.subject.iter_common_name() {
        if let Ok(cn) = cn.as_str() {
            push(cn);
        }
    }
    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns_name) = name {
                        push(dns_name);
                    }
                }
            }
        }
    }
    Ok(domains)
}

/// What to request a certificate for: a domain list, or a signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub domains: Vec<String>,
    pub csr: Option<SigningRequest>,
}

impl CertificateRequest {
    pub fn for_domains(domains: Vec<String>) -> Self {
        Self { domains, csr: None }
    }

    pub fn for_signing_request(csr: SigningRequest) -> Self {
        Self {
            domains: csr.domains().to_vec(),
            csr: Some(csr),
        }
    }

    pub fn primary_domain(&self) -> &str {
        self.domains.first().map_or("", String::as_str)
    }

    /// Ask the CA for a brand new certificate. Nothing is persisted.
    pub async fn obtain(
        &self,
        ca: &dyn CertificateAuthority,
        account: &Account,
        bundle: bool,
    ) -> Result<Certificate, crate::authority::IssuanceFailure> {
        let resource = match &self.csr {
            Some(csr) => ca.obtain_for_csr(account, csr, bundle).await?,
            None => ca.obtain(account, &self.domains, bundle).await?,
        };
        Ok(Certificate {
            request: self.clone(),
            resource,
            revision: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Certificate {
    pub request: CertificateRequest,
    pub resource: CertificateResource,
    /// Store revision of the metadata this copy was read from or written as
    pub revision: Option<u64>,
}

impl Certificate {
    pub fn domains(&self) -> &[String] {
        &self.request.domains
    }

    pub fn primary_domain(&self) -> &str {
        self.request.primary_domain()
    }

    /// Time until the leaf certificate expires. Negative once expired.
    pub fn expires_in(&self) -> RecordResult<time::Duration> {
        let not_after = leaf_not_after(&self.resource.certificate).map_err(|e| {
            RecordError::malformed(
                &format!("{}.cert", self.primary_domain()),
                format!("{e:#}"),
            )
        })?;
        Ok(not_after - time::OffsetDateTime::now_utc())
    }

    /// Certificate followed by its private key, the layout most TLS terminators read.
    pub fn combined_pem(&self) -> RecordResult<String> {
        let key = self
            .resource
            .private_key
            .as_ref()
            .ok_or(RecordError::NoPrivateKeyForPem)?;
        Ok(format!("{}{key}", self.resource.certificate))
    }

    /// Replace the material with a renewed certificate. The domain list is retained and
    /// nothing is persisted.
    pub async fn renew(
        &mut self,
        ca: &dyn CertificateAuthority,
        account: &Account,
        bundle: bool,
    ) -> anyhow::Result<()> {
        let renewed = ca.renew(account, self, bundle).await?;
        self.resource = renewed;
        Ok(())
    }

    /// Write the material to `directory` in the layout lego uses: `{domain}.crt`, `{domain}.key`,
    /// `{domain}.issuer.crt`, `{domain}.json` and (with `include_pem`) `{domain}.pem`. Every
    /// file is replaced atomically, so readers see either the old or the new content.
    pub async fn export(&self, directory: &Path, include_pem: bool) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(directory)
            .await
            .context(format!("Failed to create directory {}", directory.display()))?;
        let stem = file_stem(self.primary_domain());
        let resource = &self.resource;
        let file = |extension: &str| directory.join(format!("{stem}.{extension}"));

        if let Some(key) = &resource.private_key {
            write_replacing(&file("key"), key, true).await?;
        }
        write_replacing(&file("crt"), &resource.certificate, false).await?;
        if let Some(issuer) = &resource.metadata.issuer_certificate {
            write_replacing(&file("issuer.crt"), issuer, false).await?;
        }
        if include_pem {
            write_replacing(&file("pem"), &self.combined_pem()?, true).await?;
        }
        let metadata = serde_json::to_string_pretty(&resource.metadata)?;
        write_replacing(&file("json"), &metadata, false).await?;
        debug!("Exported certificate for {} to {}", self.primary_domain(), directory.display());
        Ok(())
    }
}

/// File name stem for a domain: wildcards are not welcome in file names.
pub fn file_stem(domain: &str) -> String {
    domain.replace('*', "_")
}

async fn write_replacing(path: &Path, contents: &str, private: bool) -> anyhow::Result<()> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    tokio::fs::write(&staging, contents)
        .await
        .context(format!("Writing to file {} failed", staging.display()))?;
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o600))
            .await
            .context(format!("Restricting permissions of {} failed", staging.display()))?;
    }
    #[cfg(not(unix))]
    let _ = private;
    tokio::fs::rename(&staging, path)
        .await
        .context(format!("Replacing file {} failed", path.display()))
}

fn leaf_not_after(pem: &str) -> anyhow::Result<time::OffsetDateTime> {
    let block = Pem::iter_from_reader(Cursor::new(pem.as_bytes()))
        .next()
        .ok_or_else(|| anyhow!("no certificate found"))?
        .context("Reading PEM block failed")?;
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(&block.contents)
        .context("Reading X.509 structure: Decoding DER failed")?;
    Ok(cert.validity().not_after.to_datetime())
}

#[derive(Clone)]
pub struct CertificateStore {
    store: Arc<dyn KeyValueStore>,
    layout: KeyLayout,
}

impl Debug for CertificateStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl CertificateStore {
    pub fn new(store: Arc<dyn KeyValueStore>, layout: KeyLayout) -> Self {
        Self { store, layout }
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Load the record of `request`'s primary domain. Metadata, certificate and (unless the
    /// certificate came from a signing request) private key must all be present.
    pub async fn load(&self, request: &CertificateRequest) -> RecordResult<Certificate> {
        let domain = request.primary_domain();
        let metadata_path = self.layout.certificate_metadata(domain);
        let metadata_entry = self
            .store
            .get(&metadata_path)
            .await?
            .ok_or_else(|| RecordError::NotFound(metadata_path.clone()))?;
        let metadata: CertificateMetadata = serde_json::from_str(&metadata_entry.value)
            .map_err(|e| RecordError::malformed(&metadata_path, e))?;

        let cert_path = self.layout.certificate(domain);
        let certificate = self
            .store
            .get(&cert_path)
            .await?
            .ok_or(RecordError::NotFound(cert_path))?
            .value;

        let key_path = self.layout.certificate_key(domain);
        let private_key = match self.store.get(&key_path).await? {
            Some(entry) => {
                // Only validated, kept as stored
                parse_private_key(&key_path, &entry.value)?;
                Some(entry.value)
            }
            None if metadata.csr.is_some() => None,
            None => return Err(RecordError::NotFound(key_path)),
        };

        Ok(Certificate {
            request: request.clone(),
            resource: CertificateResource {
                metadata,
                certificate,
                private_key,
            },
            revision: Some(metadata_entry.revision),
        })
    }

    pub async fn reload(&self, current: &Certificate) -> RecordResult<Certificate> {
        self.load(&current.request).await
    }

    /// Persist a certificate and return the store revision of its metadata.
    ///
    /// Key, certificate and (with `include_pem`) combined PEM are written first, the
    /// metadata last: readers watch the metadata key. The writes are not atomic.
    pub async fn save(&self, certificate: &Certificate, include_pem: bool) -> RecordResult<u64> {
        let combined = if include_pem {
            Some(certificate.combined_pem()?)
        } else {
            None
        };
        let domain = certificate.primary_domain();
        let resource = &certificate.resource;
        if let Some(key) = &resource.private_key {
            self.store
                .set(&self.layout.certificate_key(domain), key)
                .await?;
        }
        self.store
            .set(&self.layout.certificate(domain), &resource.certificate)
            .await?;
        if let Some(combined) = combined {
            self.store
                .set(&self.layout.certificate_pem(domain), &combined)
                .await?;
        }
        let metadata_path = self.layout.certificate_metadata(domain);
        let metadata = serde_json::to_string(&resource.metadata)
            .map_err(|e| RecordError::malformed(&metadata_path, e))?;
        let entry = self.store.set(&metadata_path, &metadata).await?;
        debug!("Saved certificate {domain} at revision {}", entry.revision);
        Ok(entry.revision)
    }
}
