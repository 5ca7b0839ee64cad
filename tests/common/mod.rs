#![allow(dead_code)]

use anyhow::Context;
use async_trait::async_trait;
use certsync::account::{Account, Registration};
use certsync::authority::{CertificateAuthority, IssuanceFailure};
use certsync::certificate::{
    Certificate, CertificateMetadata, CertificateRequest, CertificateResource, SigningRequest,
};
use certsync::lock::DistributedLock;
use certsync::service::{LifecycleOptions, LifecycleService};
use certsync::store::{KeyLayout, KeyValueStore};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use testcontainers::core::logs::LogFrame;
use testcontainers::core::logs::consumer::LogConsumer;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use url::Url;

pub const EMAIL: &str = "ops@example.com";
pub const TERMS: &str = "https://ca.example/terms/v1";

/// A certificate authority that issues self-signed certificates with a chosen validity.
#[derive(Debug)]
pub struct FakeAuthority {
    valid_for: Mutex<time::Duration>,
    failures: Mutex<BTreeMap<String, String>>,
    delay: Duration,
    pub registrations: AtomicUsize,
    pub agreements: AtomicUsize,
    pub issued: AtomicUsize,
    pub renewals: AtomicUsize,
}

impl FakeAuthority {
    pub fn new(valid_for: time::Duration) -> Self {
        Self::with_delay(valid_for, Duration::ZERO)
    }

    /// Issuance takes `delay`, so that concurrent callers overlap
    pub fn with_delay(valid_for: time::Duration, delay: Duration) -> Self {
        Self {
            valid_for: Mutex::new(valid_for),
            failures: Mutex::new(BTreeMap::new()),
            delay,
            registrations: AtomicUsize::new(0),
            agreements: AtomicUsize::new(0),
            issued: AtomicUsize::new(0),
            renewals: AtomicUsize::new(0),
        }
    }

    pub fn set_valid_for(&self, valid_for: time::Duration) {
        *self.valid_for.lock() = valid_for;
    }

    pub fn fail_domain(&self, domain: &str, reason: &str) {
        self.failures
            .lock()
            .insert(domain.to_string(), reason.to_string());
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    fn check(&self, domains: &[String]) -> Result<(), IssuanceFailure> {
        let failures: BTreeMap<String, String> = self
            .failures
            .lock()
            .iter()
            .filter(|(domain, _)| domains.contains(domain))
            .map(|(domain, reason)| (domain.clone(), reason.clone()))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(IssuanceFailure::new(failures))
        }
    }

    fn resource(&self, domains: &[String], csr: Option<&SigningRequest>) -> CertificateResource {
        let (certificate, key) = self_signed(domains, *self.valid_for.lock());
        let serial = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        CertificateResource {
            metadata: CertificateMetadata {
                domain: domains[0].clone(),
                cert_url: Url::parse(&format!("https://ca.example/cert/{serial}")).ok(),
                csr: csr.map(SigningRequest::to_pem),
                ..CertificateMetadata::default()
            },
            certificate,
            private_key: if csr.is_some() { None } else { Some(key) },
        }
    }
}

#[async_trait]
impl CertificateAuthority for FakeAuthority {
    async fn register(&self, account: &Account) -> anyhow::Result<Registration> {
        let id = self.registrations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Registration {
            uri: Some(Url::parse(&format!("https://ca.example/acct/{id}"))?),
            status: Some("valid".to_string()),
            contact: vec![format!("mailto:{}", account.email)],
            ..Registration::default()
        })
    }

    async fn agree_to_terms(&self, account: &Account) -> anyhow::Result<Registration> {
        self.agreements.fetch_add(1, Ordering::SeqCst);
        let mut registration = account
            .registration
            .clone()
            .context("agreeing to terms requires a registered account")?;
        registration.terms_of_service_agreed = true;
        registration.agreement = Some(TERMS.to_string());
        Ok(registration)
    }

    async fn obtain(
        &self,
        _account: &Account,
        domains: &[String],
        _bundle: bool,
    ) -> Result<CertificateResource, IssuanceFailure> {
        tokio::time::sleep(self.delay).await;
        self.check(domains)?;
        Ok(self.resource(domains, None))
    }

    async fn obtain_for_csr(
        &self,
        _account: &Account,
        csr: &SigningRequest,
        _bundle: bool,
    ) -> Result<CertificateResource, IssuanceFailure> {
        tokio::time::sleep(self.delay).await;
        self.check(csr.domains())?;
        Ok(self.resource(csr.domains(), Some(csr)))
    }

    async fn renew(
        &self,
        _account: &Account,
        current: &Certificate,
        _bundle: bool,
    ) -> anyhow::Result<CertificateResource> {
        tokio::time::sleep(self.delay).await;
        self.check(current.domains())?;
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(self.resource(current.domains(), current.request.csr.as_ref()))
    }
}

/// A self-signed certificate for `domains` and its key, both PEM
pub fn self_signed(domains: &[String], valid_for: time::Duration) -> (String, String) {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(domains.to_vec()).unwrap();
    params.distinguished_name = DistinguishedName::new();
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + valid_for;
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// A PEM signing request for `domains`
pub fn signing_request(domains: &[&str]) -> SigningRequest {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params =
        CertificateParams::new(domains.iter().map(ToString::to_string).collect::<Vec<_>>()).unwrap();
    params.distinguished_name = DistinguishedName::new();
    let csr = params.serialize_request(&key).unwrap();
    SigningRequest::from_bytes(csr.pem().unwrap().as_bytes()).unwrap()
}

pub fn options(domains: &[&str]) -> LifecycleOptions {
    LifecycleOptions {
        email: EMAIL.to_string(),
        request: CertificateRequest::for_domains(domains.iter().map(ToString::to_string).collect()),
        accept_tos: true,
        bundle: true,
        pem: false,
        lock_ttl: Duration::from_secs(60),
        renewal_interval: Duration::from_secs(12 * 60 * 60),
        renewal_threshold: Duration::from_secs(45 * 24 * 60 * 60),
        layout: KeyLayout::default(),
    }
}

/// A service acting as its own lock holder, like a separate process would
pub fn service(
    store: Arc<dyn KeyValueStore>,
    authority: Arc<FakeAuthority>,
    options: LifecycleOptions,
    holder: &str,
) -> LifecycleService {
    let lock = DistributedLock::with_holder(store.clone(), holder.to_string(), options.lock_ttl);
    LifecycleService::with_lock(store, authority, options, lock)
}

/// Run an etcd member with the v2 API enabled in a Docker testcontainer
pub async fn spawn_etcd_container() -> anyhow::Result<EtcdContainer> {
    let client_port = 2379.tcp();
    let container = GenericImage::new("quay.io/coreos/etcd", "v3.4.34")
        .with_exposed_port(client_port)
        .with_wait_for(WaitFor::message_on_stderr("ready to serve client requests"))
        .with_cmd([
            "etcd",
            "--enable-v2=true",
            "--listen-client-urls=http://0.0.0.0:2379",
            "--advertise-client-urls=http://0.0.0.0:2379",
        ])
        .with_log_consumer(TestLogConsumer::default())
        .start()
        .await
        .context("Failed to start etcd")?;
    let port = container
        .get_host_port_ipv4(client_port)
        .await
        .context("Failed to retrieve client port (etcd)")?;
    Ok(EtcdContainer {
        port,
        _inner: container,
    })
}

pub struct EtcdContainer {
    port: u16,
    _inner: ContainerAsync<GenericImage>,
}

impl EtcdContainer {
    pub fn client_url(&self) -> Url {
        Url::parse(&format!("http://127.0.0.1:{}", self.port)).unwrap()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TestLogConsumer {}

impl LogConsumer for TestLogConsumer {
    fn accept<'a>(&'a self, record: &'a LogFrame) -> BoxFuture<'a, ()> {
        match record {
            LogFrame::StdOut(data) => print!("{}", String::from_utf8_lossy(data)),
            LogFrame::StdErr(data) => eprint!("{}", String::from_utf8_lossy(data)),
        }
        futures::future::ready(()).boxed()
    }
}
