//! [`CertificateAuthority`] backed by the `lego` ACME command-line client.
//!
//! Every operation runs `lego` in a scratch directory seeded with the account key, then reads
//! back the files it produced. Nothing in the scratch directory outlives the call: the shared
//! store stays the only source of truth. A renewal is a fresh order for the same identity,
//! which lego answers with the existing CA account of the seeded key.

use crate::account::{Account, Registration};
use crate::authority::{CertificateAuthority, IssuanceFailure};
use crate::certificate::{
    Certificate, CertificateMetadata, CertificateResource, SigningRequest, file_stem,
};
use crate::cmd_runner::{CommandOutput, run_command};
use crate::config::SolverConfiguration;
use crate::crypto::KeyType;
use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct LegoAuthority {
    binary: PathBuf,
    server: Url,
    key_type: KeyType,
    solver: SolverConfiguration,
}

enum Operation<'a> {
    Domains(&'a [String]),
    SigningRequest(&'a Path),
}

impl LegoAuthority {
    pub fn new(
        binary: PathBuf,
        server: Url,
        key_type: KeyType,
        solver: SolverConfiguration,
    ) -> Self {
        Self {
            binary,
            server,
            key_type,
            solver,
        }
    }

    /// Directory lego keeps accounts for our server in: host (and port) with `:` replaced.
    fn account_directory(&self, root: &Path, email: &str) -> PathBuf {
        let mut server = self.server.host_str().unwrap_or_default().to_string();
        if let Some(port) = self.server.port() {
            server = format!("{server}_{port}");
        }
        root.join("accounts").join(server).join(email)
    }

    async fn workspace(&self, account: &Account) -> anyhow::Result<TempDir> {
        let workspace = tempfile::Builder::new()
            .prefix("certsync-lego-")
            .tempdir()
            .context("Creating scratch directory failed")?;
        let key = account
            .key
            .as_ref()
            .ok_or_else(|| anyhow!("account {} has no key", account.email))?;
        let key_dir = self
            .account_directory(workspace.path(), &account.email)
            .join("keys");
        tokio::fs::create_dir_all(&key_dir).await?;
        let pem = key.to_legacy_pem()?;
        tokio::fs::write(key_dir.join(format!("{}.key", account.email)), pem.to_string())
            .await
            .context("Writing account key failed")?;
        Ok(workspace)
    }

    fn arguments(
        &self,
        account: &Account,
        root: &Path,
        operation: &Operation<'_>,
        bundle: bool,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--server".into(),
            self.server.as_str().into(),
            "--email".into(),
            account.email.as_str().into(),
            "--path".into(),
            root.as_os_str().into(),
            "--key-type".into(),
            self.key_type.as_str().into(),
        ];
        if account.has_agreed_to_terms() {
            args.push("--accept-tos".into());
        }
        match &self.solver {
            SolverConfiguration::Http { listen } => {
                args.push("--http".into());
                if let Some(listen) = listen {
                    args.extend(["--http.port".into(), listen.into()]);
                }
            }
            SolverConfiguration::Tls { listen } => {
                args.push("--tls".into());
                if let Some(listen) = listen {
                    args.extend(["--tls.port".into(), listen.into()]);
                }
            }
            SolverConfiguration::Webroot { path } => {
                args.extend(["--http".into(), "--http.webroot".into(), path.into()]);
            }
            SolverConfiguration::Dns { provider, .. } => {
                args.extend(["--dns".into(), provider.into()]);
            }
        }
        match operation {
            Operation::Domains(domains) => {
                for domain in *domains {
                    args.extend(["--domains".into(), domain.into()]);
                }
            }
            Operation::SigningRequest(csr_file) => {
                args.extend(["--csr".into(), (*csr_file).into()]);
            }
        }
        args.push("run".into());
        if !bundle {
            args.push("--no-bundle".into());
        }
        args
    }

    fn environment(&self) -> HashMap<OsString, OsString> {
        match &self.solver {
            SolverConfiguration::Dns { environment, .. } => environment
                .iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            _ => HashMap::new(),
        }
    }

    async fn execute(&self, root: &Path, args: Vec<OsString>) -> anyhow::Result<CommandOutput> {
        debug!("Running {} {args:?}", self.binary.display());
        let output = run_command(self.binary.as_os_str(), args, self.environment(), root)
            .await
            .with_context(|| format!("Running {} failed", self.binary.display()))?;
        if !output.stdout.is_empty() {
            debug!("lego output: {}", output.stdout.trim_end());
        }
        Ok(output)
    }

    async fn issue(
        &self,
        account: &Account,
        domains: &[String],
        csr: Option<&SigningRequest>,
        bundle: bool,
    ) -> anyhow::Result<Result<CertificateResource, IssuanceFailure>> {
        let workspace = self.workspace(account).await?;
        let root = workspace.path();
        let csr_file = root.join("request.csr");
        let operation = match csr {
            Some(csr) => {
                tokio::fs::write(&csr_file, csr.to_pem())
                    .await
                    .context("Writing signing request failed")?;
                Operation::SigningRequest(&csr_file)
            }
            None => Operation::Domains(domains),
        };
        let output = self
            .execute(root, self.arguments(account, root, &operation, bundle))
            .await?;
        if !output.status.success() {
            return Ok(Err(failure_from_output(&output, domains)));
        }
        let primary = domains
            .first()
            .ok_or_else(|| anyhow!("no domain to issue a certificate for"))?;
        let resource = read_certificate(root, primary, csr, bundle).await?;
        info!("Certificate for {} issued", domains.join(", "));
        Ok(Ok(resource))
    }

    /// Issuance where any local problem (lego missing, unreadable output) counts as a
    /// failure of every requested domain.
    async fn obtain_all_or_nothing(
        &self,
        account: &Account,
        domains: &[String],
        csr: Option<&SigningRequest>,
        bundle: bool,
    ) -> Result<CertificateResource, IssuanceFailure> {
        self.issue(account, domains, csr, bundle)
            .await
            .unwrap_or_else(|e| {
                warn!("Certificate issuance failed: {e:#}");
                Err(IssuanceFailure::for_all(
                    domains.iter().cloned(),
                    &format!("{e:#}"),
                ))
            })
    }
}

/// lego reports per-domain problems as `[domain] reason` lines. Anything else applies to
/// every requested domain.
fn failure_from_output(output: &CommandOutput, domains: &[String]) -> IssuanceFailure {
    let mut failures = BTreeMap::new();
    for line in output.stderr.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('[') else {
            continue;
        };
        if let Some((domain, reason)) = rest.split_once(']') {
            if domains.iter().any(|requested| requested == domain) {
                failures.insert(domain.to_string(), reason.trim().to_string());
            }
        }
    }
    if failures.is_empty() {
        let reason = output
            .last_error_line()
            .map_or_else(|| format!("lego exited with {}", output.status), ToString::to_string);
        warn!("Certificate issuance failed: {reason}");
        return IssuanceFailure::for_all(domains.iter().cloned(), &reason);
    }
    IssuanceFailure::new(failures)
}

async fn read_optional(path: PathBuf) -> anyhow::Result<Option<String>> {
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context(format!("Reading {} failed", path.display()))),
    }
}

async fn read_certificate(
    root: &Path,
    domain: &str,
    csr: Option<&SigningRequest>,
    bundle: bool,
) -> anyhow::Result<CertificateResource> {
    let directory = root.join("certificates");
    let stem = file_stem(domain);
    let read = |extension: &str| read_optional(directory.join(format!("{stem}.{extension}")));
    let Some(certificate) = read("crt").await? else {
        bail!("lego did not produce a certificate for {domain}");
    };
    let private_key = read("key").await?;
    if private_key.is_none() && csr.is_none() {
        bail!("lego did not produce a private key for {domain}");
    }
    let issuer_certificate = if bundle { None } else { read("issuer.crt").await? };
    let mut metadata: CertificateMetadata = match read("json").await? {
        Some(json) => serde_json::from_str(&json).context("Parsing lego certificate metadata failed")?,
        None => CertificateMetadata::default(),
    };
    metadata.domain = domain.to_string();
    metadata.issuer_certificate = issuer_certificate;
    metadata.csr = csr.map(SigningRequest::to_pem);
    Ok(CertificateResource {
        metadata,
        certificate,
        private_key,
    })
}

#[async_trait]
impl CertificateAuthority for LegoAuthority {
    async fn register(&self, account: &Account) -> anyhow::Result<Registration> {
        // lego creates the CA account with the seeded key on its first issuance. The CA has
        // not assigned anything yet, so the record only names the contact.
        info!("Registering account {} with {}", account.email, self.server);
        Ok(Registration {
            contact: vec![format!("mailto:{}", account.email)],
            ..Registration::default()
        })
    }

    async fn agree_to_terms(&self, account: &Account) -> anyhow::Result<Registration> {
        info!("Agreeing to the terms of service of {} for {}", self.server, account.email);
        let mut registration = account.registration.clone().unwrap_or_default();
        registration.terms_of_service_agreed = true;
        Ok(registration)
    }

    async fn obtain(
        &self,
        account: &Account,
        domains: &[String],
        bundle: bool,
    ) -> Result<CertificateResource, IssuanceFailure> {
        self.obtain_all_or_nothing(account, domains, None, bundle)
            .await
    }

    async fn obtain_for_csr(
        &self,
        account: &Account,
        csr: &SigningRequest,
        bundle: bool,
    ) -> Result<CertificateResource, IssuanceFailure> {
        self.obtain_all_or_nothing(account, csr.domains(), Some(csr), bundle)
            .await
    }

    async fn renew(
        &self,
        account: &Account,
        current: &Certificate,
        bundle: bool,
    ) -> anyhow::Result<CertificateResource> {
        info!("Renewing certificate for {}", current.domains().join(", "));
        let request = &current.request;
        Ok(self
            .issue(account, &request.domains, request.csr.as_ref(), bundle)
            .await??)
    }
}
