use crate::config::{Configuration, SolverConfiguration};
use crate::crypto::{Curve, KeyType};
use crate::time::parse_duration;
use aws_lc_rs::rsa::KeySize;
use clap::{Args, Subcommand, ValueEnum};
use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;
use strum::VariantArray;
use url::Url;

/// Settings shared by every command. Each one given on the command line (or through its
/// environment variable) overrides the configuration file.
#[derive(Debug, Clone, Args, Default)]
pub struct CommonArguments {
    /// Directory URL of the ACME certificate authority
    #[clap(short = 's', long, env = "CERTSYNC_ACME_SERVER")]
    pub acme_server: Option<Url>,
    /// Email used for registration and recovery contact
    #[clap(short = 'm', long, env = "CERTSYNC_EMAIL")]
    pub email: Option<String>,
    /// Domain names to include in the certificate. The first one is the primary domain.
    #[clap(short, long, value_delimiter = ',', num_args = 1.., env = "CERTSYNC_DOMAINS")]
    pub domains: Vec<String>,
    /// Certificate signing request (PEM or DER) to use instead of --domains
    #[clap(short, long, env = "CERTSYNC_CSR", conflicts_with = "domains")]
    pub csr: Option<PathBuf>,
    /// Type of key to use for the certificate
    #[clap(short, long)]
    pub key_type: Option<CommandLineKeyType>,
    /// Agree to the certificate authority's terms of service
    #[clap(short, long, action)]
    pub accept_tos: bool,
    /// Do not bundle the issuer certificate with the certificate
    #[clap(long, action)]
    pub no_bundle: bool,
    /// Also store certificate and private key as one combined PEM
    #[clap(long, action)]
    pub pem: bool,
    /// Solve HTTP-01 challenges with a built-in server on this interface:port
    #[clap(long, value_name = "ADDR", conflicts_with_all = ["tls", "webroot", "dns"])]
    pub http: Option<String>,
    /// Solve TLS-ALPN-01 challenges with a built-in server on this interface:port
    #[clap(long, value_name = "ADDR", conflicts_with_all = ["webroot", "dns"])]
    pub tls: Option<String>,
    /// Solve HTTP-01 challenges by writing files below this existing web root
    #[clap(long, value_name = "PATH", conflicts_with = "dns")]
    pub webroot: Option<PathBuf>,
    /// Solve DNS-01 challenges with this DNS provider. Credentials are read from the environment.
    #[clap(long, value_name = "PROVIDER")]
    pub dns: Option<String>,
    /// Store endpoints: etcd client URLs, or memory:// for a single process
    #[clap(long, value_delimiter = ',', num_args = 1.., env = "CERTSYNC_STORE_ENDPOINTS")]
    pub store_endpoints: Vec<Url>,
    /// Prefix of every key this program writes to the store
    #[clap(long, env = "CERTSYNC_STORE_PREFIX")]
    pub store_prefix: Option<String>,
    /// How long a lock survives a crashed holder
    #[clap(long, value_parser = parse_duration)]
    pub lock_ttl: Option<Duration>,
    /// How often to check whether the certificate is due for renewal
    #[clap(long, value_parser = parse_duration)]
    pub renewal_interval: Option<Duration>,
    /// Renew once the certificate is valid for less than this
    #[clap(long, value_parser = parse_duration)]
    pub renewal_threshold: Option<Duration>,
    /// Path of the lego executable
    #[clap(long, env = "CERTSYNC_LEGO")]
    pub lego_binary: Option<PathBuf>,
}

impl CommonArguments {
    /// Apply every argument that was given on top of `config`.
    pub fn apply_to(&self, config: &mut Configuration) {
        if let Some(acme_server) = &self.acme_server {
            config.acme_server = acme_server.clone();
        }
        if let Some(email) = &self.email {
            config.email = email.clone();
        }
        if !self.domains.is_empty() {
            config.domains = self.domains.clone();
            config.csr = None;
        }
        if let Some(csr) = &self.csr {
            config.csr = Some(csr.clone());
            config.domains.clear();
        }
        if let Some(key_type) = self.key_type {
            config.key_type = key_type.into();
        }
        config.accept_tos |= self.accept_tos;
        if self.no_bundle {
            config.bundle = false;
        }
        config.pem |= self.pem;
        if let Some(solver) = self.solver() {
            config.solver = solver;
        }
        if !self.store_endpoints.is_empty() {
            config.store_endpoints = self.store_endpoints.clone();
        }
        if let Some(prefix) = &self.store_prefix {
            config.store_prefix = prefix.clone();
        }
        if let Some(ttl) = self.lock_ttl {
            config.lock_ttl = ttl;
        }
        if let Some(interval) = self.renewal_interval {
            config.renewal_interval = interval;
        }
        if let Some(threshold) = self.renewal_threshold {
            config.renewal_threshold = threshold;
        }
        if let Some(binary) = &self.lego_binary {
            config.lego_binary = binary.clone();
        }
    }

    fn solver(&self) -> Option<SolverConfiguration> {
        if let Some(listen) = &self.http {
            return Some(SolverConfiguration::Http {
                listen: Some(listen.clone()),
            });
        }
        if let Some(listen) = &self.tls {
            return Some(SolverConfiguration::Tls {
                listen: Some(listen.clone()),
            });
        }
        if let Some(path) = &self.webroot {
            return Some(SolverConfiguration::Webroot { path: path.clone() });
        }
        self.dns.as_ref().map(|provider| SolverConfiguration::Dns {
            provider: provider.clone(),
            environment: Default::default(),
        })
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, VariantArray)]
pub enum CommandLineKeyType {
    /// ECDSA with NIST P-256
    #[value(alias = "p256")]
    Ec256,
    /// ECDSA with NIST P-384
    #[value(alias = "p384")]
    Ec384,
    /// RSA (2048-bit key)
    Rsa2048,
    /// RSA (3072-bit key)
    Rsa3072,
    /// RSA (4096-bit key)
    Rsa4096,
    /// RSA (8192-bit key)
    Rsa8192,
}

impl Display for CommandLineKeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let enum_value = self.to_possible_value().unwrap(/* Infallible */);
        write!(f, "{}", enum_value.get_help().unwrap(/* Infallible */))
    }
}

impl From<CommandLineKeyType> for KeyType {
    fn from(key_type: CommandLineKeyType) -> Self {
        match key_type {
            CommandLineKeyType::Ec256 => KeyType::Ecdsa(Curve::P256),
            CommandLineKeyType::Ec384 => KeyType::Ecdsa(Curve::P384),
            CommandLineKeyType::Rsa2048 => KeyType::Rsa(KeySize::Rsa2048),
            CommandLineKeyType::Rsa3072 => KeyType::Rsa(KeySize::Rsa3072),
            CommandLineKeyType::Rsa4096 => KeyType::Rsa(KeySize::Rsa4096),
            CommandLineKeyType::Rsa8192 => KeyType::Rsa(KeySize::Rsa8192),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Obtain the certificate if necessary, then keep it renewed and follow changes made by other instances
    Run(RunCommand),
    /// Renew the stored certificate now, whether or not it is due
    Renew(RenewCommand),
    /// Print the effective configuration as TOML
    Config(ConfigCommand),
}

impl Command {
    pub fn common(&self) -> &CommonArguments {
        match self {
            Command::Run(cmd) => &cmd.common,
            Command::Renew(cmd) => &cmd.common,
            Command::Config(cmd) => &cmd.common,
        }
    }
}

#[derive(Debug, Args, Default)]
pub struct RunCommand {
    #[clap(flatten)]
    pub common: CommonArguments,
    /// Write the certificate files to this directory whenever the certificate changes
    #[clap(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args, Default)]
pub struct RenewCommand {
    #[clap(flatten)]
    pub common: CommonArguments,
}

#[derive(Debug, Args, Default)]
pub struct ConfigCommand {
    #[clap(flatten)]
    pub common: CommonArguments,
}
