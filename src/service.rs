//! The lifecycle service: bootstraps the account and certificate exactly once across all
//! processes sharing a store, then keeps the certificate fresh and republishes every change
//! to a local consumer.
//!
//! Certificates are handed to the consumer through a channel of capacity 1. Delivery
//! returns only once the consumer has received the certificate, so a slow consumer also
//! pauses change detection and renewal does not start before the initial certificate was
//! taken. A consumer that drops its receiver stops the service.

use crate::account::{Account, AccountStore};
use crate::authority::CertificateAuthority;
use crate::bootstrap::{ExclusiveResource, bootstrap_exclusive};
use crate::certificate::{Certificate, CertificateRequest, CertificateStore};
use crate::error::{RecordError, ServiceError, ServiceResult};
use crate::lock::{DistributedLock, LockError};
use crate::store::{KeyLayout, KeyValueStore, StoreError};
use crate::time::humanize_duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause before re-establishing a watch that failed for a reason other than cancellation
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Everything the service needs to know about what it manages. Built once from the
/// [`Configuration`](crate::config::Configuration).
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub email: String,
    pub request: CertificateRequest,
    pub accept_tos: bool,
    pub bundle: bool,
    pub pem: bool,
    pub lock_ttl: Duration,
    pub renewal_interval: Duration,
    pub renewal_threshold: Duration,
    pub layout: KeyLayout,
}

/// Result of a single renewal check.
#[derive(Debug)]
pub enum TickOutcome {
    /// The certificate is valid for longer than the renewal threshold
    NotDue { remaining: time::Duration },
    /// This process renewed and saved the certificate
    Renewed { remaining: time::Duration },
    /// Another process renewed the certificate before we got the lock
    AlreadyRenewed { remaining: time::Duration },
    /// Another process held the lock; we waited for it to finish
    LockedElsewhere,
    Failed(ServiceError),
}

pub struct LifecycleService {
    store: Arc<dyn KeyValueStore>,
    authority: Arc<dyn CertificateAuthority>,
    lock: DistributedLock,
    accounts: AccountStore,
    certificates: CertificateStore,
    options: LifecycleOptions,
}

impl Debug for LifecycleService {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleService")
            .field("authority", &self.authority)
            .field("lock", &self.lock)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl LifecycleService {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        authority: Arc<dyn CertificateAuthority>,
        options: LifecycleOptions,
    ) -> Self {
        let lock = DistributedLock::new(store.clone(), options.lock_ttl);
        Self::with_lock(store, authority, options, lock)
    }

    /// Like [`LifecycleService::new`], but coordinating through the given lock. Lets several
    /// services in one process act as distinct lock holders.
    pub fn with_lock(
        store: Arc<dyn KeyValueStore>,
        authority: Arc<dyn CertificateAuthority>,
        options: LifecycleOptions,
        lock: DistributedLock,
    ) -> Self {
        let accounts = AccountStore::new(store.clone(), options.layout.clone());
        let certificates = CertificateStore::new(store.clone(), options.layout.clone());
        Self {
            store,
            authority,
            lock,
            accounts,
            certificates,
            options,
        }
    }

    pub fn options(&self) -> &LifecycleOptions {
        &self.options
    }

    /// Run until `stop` is cancelled or the consumer goes away.
    ///
    /// Bootstraps the account and certificate, delivers the certificate once, then watches for
    /// changes and periodically checks whether renewal is due. Startup failures are returned;
    /// once running, errors are only logged.
    ///
    /// `deliveries` must be created with capacity 1: with more buffer space a delivery counts
    /// as accepted as soon as it is queued.
    pub async fn run(
        &self,
        deliveries: mpsc::Sender<Certificate>,
        stop: CancellationToken,
    ) -> ServiceResult<()> {
        if deliveries.max_capacity() > 1 {
            warn!(
                "Delivery channel has capacity {}, certificates count as delivered once queued",
                deliveries.max_capacity()
            );
        }
        // A closed receiver cancels this child only, never the caller's token
        let stop = stop.child_token();
        let bootstrapped = tokio::select! {
            biased;
            () = stop.cancelled() => None,
            bootstrapped = self.bootstrap() => Some(bootstrapped?),
        };
        let Some((account, certificate)) = bootstrapped else {
            info!("Stopped during startup");
            return Ok(());
        };

        let delivered = certificate.revision;
        let current = Mutex::new(certificate.clone());
        if !deliver(&deliveries, certificate, &stop).await {
            return Ok(());
        }

        tokio::join!(
            self.watch_loop(&current, delivered, &deliveries, &stop),
            self.renewal_loop(&account, &current, &stop),
        );
        info!("Certificate lifecycle for {} stopped", self.domain());
        Ok(())
    }

    /// Make sure the account and certificate exist in the store, creating them if no
    /// process has done so yet.
    pub async fn bootstrap(&self) -> ServiceResult<(Account, Certificate)> {
        let account = self.bootstrap_account().await?;
        let certificate = bootstrap_exclusive(
            &self.lock,
            &CertificateBootstrap {
                service: self,
                account: &account,
            },
        )
        .await?;
        info!(
            "Certificate for {} is ready (revision {})",
            certificate.domains().join(", "),
            certificate.revision.unwrap_or_default()
        );
        Ok((account, certificate))
    }

    async fn bootstrap_account(&self) -> ServiceResult<Account> {
        let account = bootstrap_exclusive(&self.lock, &AccountBootstrap { service: self }).await?;
        if account.has_agreed_to_terms() {
            return Ok(account);
        }
        if !self.options.accept_tos {
            return Err(ServiceError::TermsNotAccepted);
        }
        bootstrap_exclusive(&self.lock, &TermsAgreement { service: self }).await
    }

    /// Renew the stored certificate right away, regardless of its remaining validity.
    ///
    /// Fails with [`LockError::Held`] if another process is renewing it at the moment.
    pub async fn renew_now(&self) -> ServiceResult<Certificate> {
        let account = self.accounts.load(&self.options.email).await?;
        if !account.has_agreed_to_terms() {
            return Err(ServiceError::TermsNotAccepted);
        }
        let path = self.certificate_lock();
        let guard = self.lock.acquire(&path).await?;
        let result: ServiceResult<Certificate> = async {
            let mut certificate = self.certificates.load(&self.options.request).await?;
            self.renew_and_save(&account, &mut certificate).await?;
            Ok(certificate)
        }
        .await;
        guard.release().await;
        result
    }

    /// Check once whether the current certificate is due and renew it if so.
    pub async fn renewal_tick(&self, account: &Account, current: &Mutex<Certificate>) -> TickOutcome {
        match self.try_renewal(account, current).await {
            Ok(outcome) => outcome,
            Err(e) => TickOutcome::Failed(e),
        }
    }

    async fn try_renewal(
        &self,
        account: &Account,
        current: &Mutex<Certificate>,
    ) -> ServiceResult<TickOutcome> {
        let snapshot = current.lock().clone();
        let remaining = snapshot.expires_in()?;
        if !self.is_due(remaining) {
            return Ok(TickOutcome::NotDue { remaining });
        }
        info!(
            "Certificate for {} expires in {}, renewing",
            self.domain(),
            humanize_duration(remaining)
        );
        let path = self.certificate_lock();
        let guard = match self.lock.acquire(&path).await {
            Ok(guard) => guard,
            Err(LockError::Held(_)) => {
                self.lock.wait_for_release(&path).await?;
                return Ok(TickOutcome::LockedElsewhere);
            }
            Err(e) => return Err(e.into()),
        };
        let result = self.renew_locked(account, &snapshot).await;
        guard.release().await;
        let (certificate, renewed) = result?;
        let remaining = certificate.expires_in()?;
        *current.lock() = certificate;
        Ok(if renewed {
            TickOutcome::Renewed { remaining }
        } else {
            TickOutcome::AlreadyRenewed { remaining }
        })
    }

    /// Renew while holding the certificate lock. Returns the freshest certificate and whether
    /// this process renewed it.
    async fn renew_locked(
        &self,
        account: &Account,
        snapshot: &Certificate,
    ) -> ServiceResult<(Certificate, bool)> {
        // Someone else may have renewed between our check and the acquire
        let mut certificate = self.certificates.reload(snapshot).await?;
        if !self.is_due(certificate.expires_in()?) {
            return Ok((certificate, false));
        }
        self.renew_and_save(account, &mut certificate).await?;
        Ok((certificate, true))
    }

    async fn renew_and_save(&self, account: &Account, certificate: &mut Certificate) -> ServiceResult<()> {
        certificate
            .renew(self.authority.as_ref(), account, self.options.bundle)
            .await
            .map_err(ServiceError::Authority)?;
        let revision = self.certificates.save(certificate, self.options.pem).await?;
        certificate.revision = Some(revision);
        info!("Renewed certificate for {}", certificate.domains().join(", "));
        Ok(())
    }

    async fn renewal_loop(&self, account: &Account, current: &Mutex<Certificate>, stop: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.renewal_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let outcome = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                outcome = self.renewal_tick(account, current) => outcome,
            };
            let domain = self.domain();
            match outcome {
                TickOutcome::NotDue { remaining } => debug!(
                    "Certificate for {domain} is not due for renewal, valid for {}",
                    humanize_duration(remaining)
                ),
                TickOutcome::Renewed { remaining } => info!(
                    "Certificate for {domain} renewed, now valid for {}",
                    humanize_duration(remaining)
                ),
                TickOutcome::AlreadyRenewed { remaining } => info!(
                    "Certificate for {domain} was already renewed by another process, valid for {}",
                    humanize_duration(remaining)
                ),
                TickOutcome::LockedElsewhere => {
                    info!("Certificate for {domain} was being renewed by another process");
                }
                TickOutcome::Failed(e) => {
                    error!("Renewing certificate for {domain} failed, retrying next interval: {e:#}");
                }
            }
        }
        debug!("Renewal loop for {} stopped", self.domain());
    }

    /// Forward every change of the stored certificate to the consumer.
    async fn watch_loop(
        &self,
        current: &Mutex<Certificate>,
        mut delivered: Option<u64>,
        deliveries: &mpsc::Sender<Certificate>,
        stop: &CancellationToken,
    ) {
        let key = self.options.layout.certificate_metadata(self.domain());
        let mut after = delivered;
        loop {
            let event = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                event = self.store.watch(&key, after) => event,
            };
            match event {
                Ok(event) => {
                    after = Some(event.revision);
                    if !event.action.is_mutation() {
                        debug!("Ignoring {} on {key}", event.action);
                        continue;
                    }
                }
                Err(StoreError::HistoryCompacted { revision, .. }) => {
                    warn!("Changes to {key} after revision {revision} are no longer available, resynchronizing");
                    after = None;
                }
                Err(e) => {
                    warn!("Watching {key} failed, retrying in {}s: {e}", WATCH_RETRY_DELAY.as_secs());
                    tokio::select! {
                        biased;
                        () = stop.cancelled() => break,
                        () = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                    }
                    continue;
                }
            }

            let request = current.lock().request.clone();
            let certificate = match self.certificates.load(&request).await {
                Ok(certificate) => certificate,
                Err(e) => {
                    warn!("Reloading certificate for {} failed: {e}", self.domain());
                    continue;
                }
            };
            if certificate.revision == delivered {
                continue;
            }
            delivered = certificate.revision;
            *current.lock() = certificate.clone();
            debug!(
                "Certificate for {} changed (revision {})",
                self.domain(),
                delivered.unwrap_or_default()
            );
            if !deliver(deliveries, certificate, stop).await {
                break;
            }
        }
        debug!("Watch loop for {} stopped", self.domain());
    }

    fn is_due(&self, remaining: time::Duration) -> bool {
        let threshold =
            time::Duration::try_from(self.options.renewal_threshold).unwrap_or(time::Duration::MAX);
        remaining < threshold
    }

    fn domain(&self) -> &str {
        self.options.request.primary_domain()
    }

    fn certificate_lock(&self) -> String {
        self.options.layout.certificate_lock(self.domain())
    }
}

/// Hand a certificate to the consumer and wait until it was received. Returns false if the
/// service should stop.
async fn deliver(
    deliveries: &mpsc::Sender<Certificate>,
    certificate: Certificate,
    stop: &CancellationToken,
) -> bool {
    let accepted = async {
        deliveries.send(certificate).await.ok()?;
        // With capacity 1 the slot only frees up once the consumer took the certificate
        drop(deliveries.reserve().await.ok()?);
        Some(())
    };
    tokio::select! {
        biased;
        () = stop.cancelled() => false,
        accepted = accepted => {
            if accepted.is_none() {
                info!("Certificate consumer went away, stopping");
                stop.cancel();
                return false;
            }
            true
        }
    }
}

fn not_found_as_none<T>(result: Result<T, RecordError>) -> ServiceResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(RecordError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

struct AccountBootstrap<'a> {
    service: &'a LifecycleService,
}

#[async_trait]
impl<'a> ExclusiveResource for AccountBootstrap<'a> {
    type Output = Account;

    fn describe(&self) -> String {
        format!("account {}", self.service.options.email)
    }

    fn lock_path(&self) -> String {
        self.service.options.layout.account_lock(&self.service.options.email)
    }

    async fn load(&self) -> ServiceResult<Option<Account>> {
        not_found_as_none(self.service.accounts.load(&self.service.options.email).await)
    }

    async fn create(&self) -> ServiceResult<Account> {
        let service = self.service;
        let email = &service.options.email;
        // A key may survive from an earlier attempt that failed to register
        let mut account = match service.accounts.load_key(email).await? {
            Some(key) => {
                debug!("Reusing stored key for account {email}");
                Account::with_key(email, key)
            }
            None => Account::generate_key(email)?,
        };
        let authority = service.authority.as_ref();
        account
            .register(authority)
            .await
            .map_err(ServiceError::Authority)?;
        if service.options.accept_tos {
            account
                .agree_to_terms(authority)
                .await
                .map_err(ServiceError::Authority)?;
        }
        service.accounts.save(&account).await?;
        info!("Registered account {email}");
        Ok(account)
    }
}

/// Records terms agreement for an account registered earlier without it.
struct TermsAgreement<'a> {
    service: &'a LifecycleService,
}

#[async_trait]
impl<'a> ExclusiveResource for TermsAgreement<'a> {
    type Output = Account;

    fn describe(&self) -> String {
        format!("terms agreement of account {}", self.service.options.email)
    }

    fn lock_path(&self) -> String {
        self.service.options.layout.account_lock(&self.service.options.email)
    }

    async fn load(&self) -> ServiceResult<Option<Account>> {
        let account = self.service.accounts.load(&self.service.options.email).await?;
        Ok(account.has_agreed_to_terms().then_some(account))
    }

    async fn create(&self) -> ServiceResult<Account> {
        let service = self.service;
        let mut account = service.accounts.load(&service.options.email).await?;
        account
            .agree_to_terms(service.authority.as_ref())
            .await
            .map_err(ServiceError::Authority)?;
        service.accounts.save(&account).await?;
        info!("Agreed to the terms of service for account {}", account.email);
        Ok(account)
    }
}

struct CertificateBootstrap<'a> {
    service: &'a LifecycleService,
    account: &'a Account,
}

#[async_trait]
impl<'a> ExclusiveResource for CertificateBootstrap<'a> {
    type Output = Certificate;

    fn describe(&self) -> String {
        format!("certificate for {}", self.service.domain())
    }

    fn lock_path(&self) -> String {
        self.service.certificate_lock()
    }

    async fn load(&self) -> ServiceResult<Option<Certificate>> {
        not_found_as_none(self.service.certificates.load(&self.service.options.request).await)
    }

    async fn create(&self) -> ServiceResult<Certificate> {
        let service = self.service;
        let mut certificate = service
            .options
            .request
            .obtain(service.authority.as_ref(), self.account, service.options.bundle)
            .await?;
        let revision = service.certificates.save(&certificate, service.options.pem).await?;
        certificate.revision = Some(revision);
        Ok(certificate)
    }
}
