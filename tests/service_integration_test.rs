mod common;

use crate::common::{EMAIL, FakeAuthority, options, service, signing_request};
use certsync::certificate::CertificateRequest;
use certsync::error::{RecordError, ServiceError};
use certsync::lock::LockError;
use certsync::service::TickOutcome;
use certsync::store::{KeyLayout, KeyValueStore, MemoryStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use test_log::test;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DOMAIN: &str = "example.com";
const WAIT: Duration = Duration::from_secs(5);

fn long() -> time::Duration {
    time::Duration::days(90)
}

fn short() -> time::Duration {
    time::Duration::days(10)
}

fn certificate_keys(store: &MemoryStore) -> Vec<String> {
    store
        .keys()
        .into_iter()
        .filter(|key| key.contains("/certificates/"))
        .collect()
}

#[test(tokio::test)]
async fn test_bootstrap_creates_account_and_certificate() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    let service = service(store.clone(), authority.clone(), options(&[DOMAIN, "www.example.com"]), "a");

    let (account, certificate) = service.bootstrap().await.unwrap();

    assert!(account.has_agreed_to_terms());
    assert_eq!(certificate.domains(), [DOMAIN, "www.example.com"]);
    assert_eq!(authority.issued(), 1);
    assert_eq!(
        store.keys(),
        [
            "/certsync/accounts/ops@example.com/key",
            "/certsync/accounts/ops@example.com/registration",
            "/certsync/certificates/example.com.cert",
            "/certsync/certificates/example.com.json",
            "/certsync/certificates/example.com.key",
        ]
    );
}

#[test(tokio::test)]
async fn test_second_bootstrap_does_not_write() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    let service = service(store.clone(), authority.clone(), options(&[DOMAIN]), "a");

    let (_, first) = service.bootstrap().await.unwrap();
    let revision = store.revision();
    let (_, second) = service.bootstrap().await.unwrap();

    assert_eq!(store.revision(), revision);
    assert_eq!(second.resource, first.resource);
    assert_eq!(second.revision, first.revision);
    assert_eq!(authority.issued(), 1);
    assert_eq!(authority.registrations.load(Ordering::SeqCst), 1);
}

#[test(tokio::test)]
async fn test_concurrent_bootstrap_issues_once() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::with_delay(long(), Duration::from_millis(50)));
    let services: Vec<_> = (0..4)
        .map(|i| service(store.clone(), authority.clone(), options(&[DOMAIN]), &format!("holder-{i}")))
        .collect();

    let results = futures::future::join_all(services.iter().map(|service| service.bootstrap())).await;

    let certificates: Vec<_> = results.into_iter().map(|result| result.unwrap().1).collect();
    assert_eq!(authority.issued(), 1);
    assert_eq!(authority.registrations.load(Ordering::SeqCst), 1);
    assert!(
        certificates
            .iter()
            .all(|certificate| certificate.resource == certificates[0].resource)
    );
}

#[test(tokio::test)]
async fn test_terms_must_be_accepted() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    let mut declining = options(&[DOMAIN]);
    declining.accept_tos = false;
    let declined = service(store.clone(), authority.clone(), declining, "a");

    let err = declined.bootstrap().await.unwrap_err();
    assert!(matches!(err, ServiceError::TermsNotAccepted));
    assert_eq!(authority.issued(), 0);
    assert!(certificate_keys(&store).is_empty());

    // The registration is kept, agreeing later does not register again
    let accepted = service(store.clone(), authority.clone(), options(&[DOMAIN]), "a");
    let (account, _) = accepted.bootstrap().await.unwrap();
    assert!(account.has_agreed_to_terms());
    assert_eq!(authority.registrations.load(Ordering::SeqCst), 1);
    assert_eq!(authority.agreements.load(Ordering::SeqCst), 1);
}

#[test(tokio::test)]
async fn test_issuance_is_all_or_nothing() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    authority.fail_domain("b.example", "no such host");
    let service = service(store.clone(), authority, options(&["a.example", "b.example"]), "a");

    let err = service.bootstrap().await.unwrap_err();

    let ServiceError::Issuance(failure) = &err else {
        panic!("expected an issuance failure, got {err:?}");
    };
    assert_eq!(failure.domains().collect::<Vec<_>>(), ["b.example"]);
    assert!(err.to_string().contains("b.example"));
    assert!(certificate_keys(&store).is_empty());
}

#[test(tokio::test)]
async fn test_combined_pem_for_domains() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    let mut options = options(&[DOMAIN]);
    options.pem = true;
    let service = service(store.clone(), authority, options, "a");

    let (_, certificate) = service.bootstrap().await.unwrap();

    let layout = KeyLayout::default();
    let pem = store.get(&layout.certificate_pem(DOMAIN)).await.unwrap().unwrap();
    let cert = store.get(&layout.certificate(DOMAIN)).await.unwrap().unwrap();
    let key = store.get(&layout.certificate_key(DOMAIN)).await.unwrap().unwrap();
    assert_eq!(pem.value, format!("{}{}", cert.value, key.value));
    assert_eq!(certificate.combined_pem().unwrap(), pem.value);
}

#[test(tokio::test)]
async fn test_combined_pem_for_signing_request_fails() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    let mut options = options(&[]);
    options.request = CertificateRequest::for_signing_request(signing_request(&[DOMAIN]));
    options.pem = true;
    let service = service(store.clone(), authority, options, "a");

    let err = service.bootstrap().await.unwrap_err();

    assert!(matches!(
        err,
        ServiceError::Record(RecordError::NoPrivateKeyForPem)
    ));
    assert!(certificate_keys(&store).is_empty());
}

#[test(tokio::test)]
async fn test_signing_request_without_pem() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    let mut options = options(&[]);
    options.request = CertificateRequest::for_signing_request(signing_request(&[DOMAIN, "www.example.com"]));
    let service = service(store.clone(), authority, options, "a");

    let (_, certificate) = service.bootstrap().await.unwrap();

    assert_eq!(certificate.primary_domain(), DOMAIN);
    assert!(certificate.resource.private_key.is_none());
    assert_eq!(
        certificate_keys(&store),
        [
            "/certsync/certificates/example.com.cert",
            "/certsync/certificates/example.com.json",
        ]
    );
    // Loading again accepts the record without a key
    let (_, reloaded) = service.bootstrap().await.unwrap();
    assert_eq!(reloaded.resource, certificate.resource);
}

#[test(tokio::test)]
async fn test_renewal_tick_not_due() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    let service = service(store.clone(), authority.clone(), options(&[DOMAIN]), "a");
    let (account, certificate) = service.bootstrap().await.unwrap();
    let revision = store.revision();

    let outcome = service.renewal_tick(&account, &Mutex::new(certificate)).await;

    assert!(matches!(outcome, TickOutcome::NotDue { .. }), "{outcome:?}");
    assert_eq!(store.revision(), revision);
    assert_eq!(authority.renewals(), 0);
}

#[test(tokio::test)]
async fn test_renewal_tick_renews_when_due() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(short()));
    let service = service(store.clone(), authority.clone(), options(&[DOMAIN]), "a");
    let (account, certificate) = service.bootstrap().await.unwrap();
    authority.set_valid_for(long());
    let current = Mutex::new(certificate.clone());

    let outcome = service.renewal_tick(&account, &current).await;

    let TickOutcome::Renewed { remaining } = outcome else {
        panic!("expected a renewal, got {outcome:?}");
    };
    assert!(remaining > time::Duration::days(80));
    assert_eq!(authority.renewals(), 1);
    let renewed = current.lock().clone();
    assert_ne!(renewed.resource.certificate, certificate.resource.certificate);
    assert_eq!(renewed.domains(), certificate.domains());
    assert!(renewed.revision > certificate.revision);
    let stored = store
        .get(&KeyLayout::default().certificate(DOMAIN))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.value, renewed.resource.certificate);
    assert!(
        store.get(&KeyLayout::default().certificate_lock(DOMAIN)).await.unwrap().is_none(),
        "lock must be released"
    );
}

#[test(tokio::test)]
async fn test_renewal_tick_after_renewal_elsewhere() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(short()));
    let first = service(store.clone(), authority.clone(), options(&[DOMAIN]), "a");
    let second = service(store.clone(), authority.clone(), options(&[DOMAIN]), "b");
    let (account, certificate) = first.bootstrap().await.unwrap();
    authority.set_valid_for(long());

    let renewed = first.renewal_tick(&account, &Mutex::new(certificate.clone())).await;
    assert!(matches!(renewed, TickOutcome::Renewed { .. }), "{renewed:?}");
    // The second instance still holds the old certificate
    let stale = Mutex::new(certificate);
    let outcome = second.renewal_tick(&account, &stale).await;

    assert!(matches!(outcome, TickOutcome::AlreadyRenewed { .. }), "{outcome:?}");
    assert_eq!(authority.renewals(), 1);
    assert!(stale.lock().expires_in().unwrap() > time::Duration::days(80));
}

#[test(tokio::test)]
async fn test_renewal_tick_waits_for_other_holder() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(short()));
    let service = service(store.clone(), authority.clone(), options(&[DOMAIN]), "a");
    let (account, certificate) = service.bootstrap().await.unwrap();
    let lock_path = KeyLayout::default().certificate_lock(DOMAIN);
    store.create(&lock_path, "b", Duration::from_secs(60)).await.unwrap();
    let releaser = {
        let store = store.clone();
        let lock_path = lock_path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.delete_if(&lock_path, "b").await
        })
    };

    let outcome = tokio::time::timeout(WAIT, service.renewal_tick(&account, &Mutex::new(certificate)))
        .await
        .unwrap();

    releaser.await.unwrap().unwrap();
    assert!(matches!(outcome, TickOutcome::LockedElsewhere), "{outcome:?}");
    assert_eq!(authority.renewals(), 0);
}

#[test(tokio::test)]
async fn test_renewal_failure_is_reported_per_tick() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(short()));
    let service = service(store.clone(), authority.clone(), options(&[DOMAIN]), "a");
    let (account, certificate) = service.bootstrap().await.unwrap();
    authority.fail_domain(DOMAIN, "rate limited");
    let revision = store.revision();
    let current = Mutex::new(certificate.clone());

    let outcome = service.renewal_tick(&account, &current).await;

    assert!(matches!(outcome, TickOutcome::Failed(ServiceError::Authority(_))), "{outcome:?}");
    assert_eq!(current.lock().resource, certificate.resource);
    // Only the lock was taken and released
    assert_eq!(store.revision(), revision + 2);
    assert!(certificate_keys(&store).iter().all(|key| !key.ends_with(".lock")));
}

#[test(tokio::test)]
async fn test_renew_now() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    let service = service(store.clone(), authority.clone(), options(&[DOMAIN]), "a");
    let (_, certificate) = service.bootstrap().await.unwrap();

    let renewed = service.renew_now().await.unwrap();

    assert_eq!(authority.renewals(), 1);
    assert_ne!(renewed.resource.certificate, certificate.resource.certificate);
    assert!(renewed.revision > certificate.revision);
}

#[test(tokio::test)]
async fn test_renew_now_while_locked() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    let service = service(store.clone(), authority.clone(), options(&[DOMAIN]), "a");
    service.bootstrap().await.unwrap();
    store
        .create(&KeyLayout::default().certificate_lock(DOMAIN), "b", Duration::from_secs(60))
        .await
        .unwrap();

    let err = service.renew_now().await.unwrap_err();

    assert!(matches!(err, ServiceError::Lock(LockError::Held(_))));
    assert_eq!(authority.renewals(), 0);
}

#[test(tokio::test)]
async fn test_renew_now_without_account() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    let service = service(store, authority, options(&[DOMAIN]), "a");

    let err = service.renew_now().await.unwrap_err();

    assert!(matches!(err, ServiceError::Record(RecordError::NotFound(key)) if key.contains(EMAIL)));
}

#[test(tokio::test)]
async fn test_run_delivers_changes_from_other_instances() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    let running = Arc::new(service(store.clone(), authority.clone(), options(&[DOMAIN]), "a"));
    let other = service(store.clone(), authority.clone(), options(&[DOMAIN]), "b");
    let stop = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(1);
    let handle = {
        let running = running.clone();
        let stop = stop.clone();
        tokio::spawn(async move { running.run(tx, stop).await })
    };

    let initial = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let renewed = other.renew_now().await.unwrap();
    let delivered = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();

    assert_ne!(initial.resource.certificate, delivered.resource.certificate);
    assert_eq!(delivered.resource, renewed.resource);
    assert_eq!(delivered.revision, renewed.revision);

    stop.cancel();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
}

#[test(tokio::test)]
async fn test_run_renews_when_due() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(short()));
    let mut options = options(&[DOMAIN]);
    options.renewal_interval = Duration::from_millis(20);
    let running = service(store.clone(), authority.clone(), options, "a");
    // Stored by an earlier run, renewals from now on are long-lived
    running.bootstrap().await.unwrap();
    authority.set_valid_for(long());
    let stop = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<certsync::certificate::Certificate>(1);

    let consumer = async {
        let initial = rx.recv().await.unwrap();
        assert!(initial.expires_in().unwrap() < time::Duration::days(11));
        let renewed = rx.recv().await.unwrap();
        assert!(renewed.expires_in().unwrap() > time::Duration::days(80));
        stop.cancel();
    };
    let (result, ()) = tokio::time::timeout(WAIT, async { tokio::join!(running.run(tx, stop.clone()), consumer) })
        .await
        .unwrap();

    result.unwrap();
    assert_eq!(authority.renewals(), 1);
}

#[test(tokio::test)]
async fn test_no_renewal_before_initial_certificate_is_received() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(short()));
    let mut options = options(&[DOMAIN]);
    options.renewal_interval = Duration::from_millis(20);
    let running = Arc::new(service(store.clone(), authority.clone(), options, "a"));
    running.bootstrap().await.unwrap();
    let revision = store.revision();
    let stop = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(1);
    let handle = {
        let running = running.clone();
        let stop = stop.clone();
        tokio::spawn(async move { running.run(tx, stop).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(authority.renewals(), 0);
    assert_eq!(store.revision(), revision);

    stop.cancel();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
    let queued = rx.recv().await.unwrap();
    assert!(queued.expires_in().unwrap() < time::Duration::days(11));
}

#[test(tokio::test)]
async fn test_stop_unblocks_watch_without_further_writes() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    let running = Arc::new(service(store.clone(), authority, options(&[DOMAIN]), "a"));
    let stop = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(1);
    let handle = {
        let running = running.clone();
        let stop = stop.clone();
        tokio::spawn(async move { running.run(tx, stop).await })
    };
    rx.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let revision = store.revision();

    stop.cancel();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();

    assert_eq!(store.revision(), revision);
}

#[test(tokio::test)]
async fn test_run_stops_when_consumer_leaves() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    let running = service(store, authority, options(&[DOMAIN]), "a");
    let stop = CancellationToken::new();
    let (tx, rx) = mpsc::channel(1);
    drop(rx);

    tokio::time::timeout(WAIT, running.run(tx, stop.clone()))
        .await
        .unwrap()
        .unwrap();

    assert!(!stop.is_cancelled(), "the caller's token is left alone");
}

#[test(tokio::test)]
async fn test_run_reports_startup_failure() {
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(FakeAuthority::new(long()));
    let mut declining = options(&[DOMAIN]);
    declining.accept_tos = false;
    let running = service(store, authority, declining, "a");
    let (tx, _rx) = mpsc::channel(1);

    let err = running.run(tx, CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, ServiceError::TermsNotAccepted));
}
