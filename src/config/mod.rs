//! Process configuration. Constructed once at startup (file, then command line) and passed
//! by value into the services; there is no global configuration state.

use crate::certificate::{CertificateRequest, SigningRequest};
use crate::config::toml::TomlConfiguration;
use crate::crypto::KeyType;
use crate::service::LifecycleOptions;
use crate::store::{DEFAULT_PREFIX, DEFAULT_STORE_TIMEOUT, KeyLayout};
use crate::time::serde_duration;
use anyhow::{Context, bail};
use aws_lc_rs::rsa::KeySize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

mod toml;

pub const DEFAULT_ACME_SERVER: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const DEFAULT_LOCK_TTL: Duration = crate::lock::DEFAULT_LOCK_TTL;
pub const DEFAULT_RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
pub const DEFAULT_RENEWAL_THRESHOLD: Duration = Duration::from_secs(45 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default = "default_acme_server")]
    pub acme_server: Url,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csr: Option<PathBuf>,
    #[serde(default = "default_key_type")]
    pub key_type: KeyType,
    #[serde(default)]
    pub accept_tos: bool,
    #[serde(default = "default_true")]
    pub bundle: bool,
    #[serde(default)]
    pub pem: bool,
    #[serde(default)]
    pub solver: SolverConfiguration,
    #[serde(default)]
    pub store_endpoints: Vec<Url>,
    #[serde(default = "default_store_prefix")]
    pub store_prefix: String,
    #[serde(default = "default_store_timeout", with = "serde_duration")]
    pub store_timeout: Duration,
    #[serde(default = "default_lock_ttl", with = "serde_duration")]
    pub lock_ttl: Duration,
    #[serde(default = "default_renewal_interval", with = "serde_duration")]
    pub renewal_interval: Duration,
    #[serde(default = "default_renewal_threshold", with = "serde_duration")]
    pub renewal_threshold: Duration,
    #[serde(default = "default_lego_binary")]
    pub lego_binary: PathBuf,
}

/// How challenges are answered, forwarded to the certificate authority client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SolverConfiguration {
    /// HTTP-01 with a built-in server, optionally on a specific `interface:port`
    Http {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        listen: Option<String>,
    },
    /// TLS-ALPN-01 with a built-in server, optionally on a specific `interface:port`
    Tls {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        listen: Option<String>,
    },
    /// HTTP-01 by writing challenge files below an existing web root
    Webroot { path: PathBuf },
    /// DNS-01 through a named DNS provider. Provider credentials are passed as environment.
    Dns {
        provider: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        environment: BTreeMap<String, String>,
    },
}

impl Default for SolverConfiguration {
    fn default() -> Self {
        SolverConfiguration::Http { listen: None }
    }
}

fn default_acme_server() -> Url {
    Url::parse(DEFAULT_ACME_SERVER).unwrap(/* Infallible */)
}

fn default_key_type() -> KeyType {
    KeyType::Rsa(KeySize::Rsa2048)
}

fn default_true() -> bool {
    true
}

fn default_store_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_store_timeout() -> Duration {
    DEFAULT_STORE_TIMEOUT
}

fn default_lock_ttl() -> Duration {
    DEFAULT_LOCK_TTL
}

fn default_renewal_interval() -> Duration {
    DEFAULT_RENEWAL_INTERVAL
}

fn default_renewal_threshold() -> Duration {
    DEFAULT_RENEWAL_THRESHOLD
}

fn default_lego_binary() -> PathBuf {
    PathBuf::from("lego")
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            acme_server: default_acme_server(),
            email: String::new(),
            domains: Vec::new(),
            csr: None,
            key_type: default_key_type(),
            accept_tos: false,
            bundle: true,
            pem: false,
            solver: SolverConfiguration::default(),
            store_endpoints: Vec::new(),
            store_prefix: default_store_prefix(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            lock_ttl: DEFAULT_LOCK_TTL,
            renewal_interval: DEFAULT_RENEWAL_INTERVAL,
            renewal_threshold: DEFAULT_RENEWAL_THRESHOLD,
            lego_binary: default_lego_binary(),
        }
    }
}

impl Configuration {
    /// Check the configuration for consistency before anything touches the network.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.email.trim().is_empty() {
            bail!("An account email is required (--email)");
        }
        match (self.domains.is_empty(), self.csr.is_some()) {
            (false, true) => bail!("Please specify either --domains or --csr, but not both"),
            (true, false) => bail!("Please specify either --domains or --csr"),
            _ => {}
        }
        if self.domains.iter().any(|domain| domain.trim().is_empty()) {
            bail!("Domain names must not be empty");
        }
        if self.store_endpoints.is_empty() {
            bail!("Please specify at least one store endpoint with --store-endpoints");
        }
        for (name, value) in [
            ("store_timeout", self.store_timeout),
            ("lock_ttl", self.lock_ttl),
            ("renewal_interval", self.renewal_interval),
            ("renewal_threshold", self.renewal_threshold),
        ] {
            if value.is_zero() {
                bail!("{name} must be greater than zero");
            }
        }
        match &self.solver {
            SolverConfiguration::Http { listen: Some(addr) }
            | SolverConfiguration::Tls { listen: Some(addr) }
                if !addr.contains(':') =>
            {
                bail!("Listen address {addr} is invalid, it should be interface:port or :port");
            }
            SolverConfiguration::Webroot { path } if path.as_os_str().is_empty() => {
                bail!("The webroot path must not be empty");
            }
            SolverConfiguration::Dns { provider, .. } if provider.trim().is_empty() => {
                bail!("A DNS provider name is required for the dns solver");
            }
            _ => {}
        }
        Ok(())
    }

    pub fn layout(&self) -> KeyLayout {
        KeyLayout::new(&self.store_prefix)
    }

    /// Resolve what to request a certificate for. Reads the signing request, if configured.
    pub async fn certificate_request(&self) -> anyhow::Result<CertificateRequest> {
        Ok(match &self.csr {
            Some(path) => CertificateRequest::for_signing_request(
                SigningRequest::from_file(path).await?,
            ),
            None => CertificateRequest::for_domains(self.domains.clone()),
        })
    }

    pub async fn lifecycle_options(&self) -> anyhow::Result<LifecycleOptions> {
        Ok(LifecycleOptions {
            email: self.email.clone(),
            request: self.certificate_request().await?,
            accept_tos: self.accept_tos,
            bundle: self.bundle,
            pem: self.pem,
            lock_ttl: self.lock_ttl,
            renewal_interval: self.renewal_interval,
            renewal_threshold: self.renewal_threshold,
            layout: self.layout(),
        })
    }
}

/// Load the configuration file, or the defaults if no file is given.
pub fn load(file: Option<&Path>) -> anyhow::Result<Configuration> {
    match file {
        Some(file) => TomlConfiguration::load(file)
            .with_context(|| format!("Loading configuration file {} failed", file.display())),
        None => Ok(Configuration::default()),
    }
}

/// The configuration as a TOML document, the same format [`load`] reads.
pub fn render(config: &Configuration) -> anyhow::Result<String> {
    TomlConfiguration::to_toml(config)
}
