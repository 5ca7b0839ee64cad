//! Advisory mutual exclusion between processes sharing one store.
//!
//! A lock is a store key created only if absent, holding a token that identifies the holder
//! and expiring after a TTL so that a crashed holder cannot block everyone forever. Release
//! is a delete conditioned on the token still being ours: if the TTL ran out and somebody
//! else took the lock in the meantime, we must not remove their claim.

use crate::store::{KeyValueStore, StoreError};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Locks are reclaimed by the store after this long, even if never released
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60 * 60);
/// Pause before asking the store again after a timed out or broken request while waiting
const WAIT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {0} is held by another process")]
    Held(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Token identifying this process as a lock holder: `{hostname}-{pid}`, with `n/a` standing
/// in for a hostname that cannot be determined.
pub fn holder_token() -> String {
    let host = match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("Cannot determine hostname, identifying lock ownership by process id only: {e}");
            "n/a".to_string()
        }
    };
    format!("{host}-{}", std::process::id())
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    holder: String,
    ttl: Duration,
}

impl Debug for DistributedLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("holder", &self.holder)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self::with_holder(store, holder_token(), ttl)
    }

    /// Like [`DistributedLock::new`], with an explicit holder token. Two locks must only
    /// share a token if they belong to the same logical owner.
    pub fn with_holder(store: Arc<dyn KeyValueStore>, holder: String, ttl: Duration) -> Self {
        Self { store, holder, ttl }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Try once to take the lock at `path`. Never waits.
    ///
    /// # Errors
    ///
    /// [`LockError::Held`] if any process (including this one) currently holds the lock.
    pub async fn acquire(&self, path: &str) -> Result<LockGuard, LockError> {
        match self.store.create(path, &self.holder, self.ttl).await {
            Ok(_) => {
                debug!("Acquired lock {path} as {}", self.holder);
                Ok(LockGuard {
                    store: self.store.clone(),
                    path: path.to_string(),
                    holder: self.holder.clone(),
                    released: false,
                })
            }
            Err(StoreError::AlreadyExists(_)) => Err(LockError::Held(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until the lock at `path` is released or expires.
    ///
    /// Returns immediately if the lock is not held. Changes to the key other than its removal
    /// are ignored. Timed out or broken store requests are retried until the store has been
    /// failing for longer than the lock TTL.
    pub async fn wait_for_release(&self, path: &str) -> Result<(), LockError> {
        let mut failing_since: Option<Instant> = None;
        'outer: loop {
            let entry = match self.store.get(path).await {
                Ok(entry) => {
                    failing_since = None;
                    entry
                }
                Err(e) => {
                    self.retry_after(path, e, &mut failing_since).await?;
                    continue 'outer;
                }
            };
            let Some(entry) = entry else {
                return Ok(());
            };
            info!(
                "Lock {path} is held by {}, waiting for it to be released",
                entry.value
            );
            let mut revision = entry.revision;
            loop {
                match self.store.watch(path, Some(revision)).await {
                    Ok(event) if event.action.is_removal() => {
                        debug!("Lock {path} released ({})", event.action);
                        return Ok(());
                    }
                    Ok(event) => {
                        debug!("Ignoring {} on lock {path} while waiting", event.action);
                        revision = event.revision;
                    }
                    Err(StoreError::NotFound(_)) => return Ok(()),
                    Err(StoreError::HistoryCompacted { .. }) => continue 'outer,
                    Err(e) => {
                        self.retry_after(path, e, &mut failing_since).await?;
                        continue 'outer;
                    }
                }
            }
        }
    }

    /// Sleep before the next attempt if `error` is worth retrying, otherwise hand it back.
    async fn retry_after(
        &self,
        path: &str,
        error: StoreError,
        failing_since: &mut Option<Instant>,
    ) -> Result<(), LockError> {
        if !matches!(error, StoreError::TimedOut | StoreError::Http(_)) {
            return Err(error.into());
        }
        let since = *failing_since.get_or_insert_with(Instant::now);
        if since.elapsed() > self.ttl {
            return Err(error.into());
        }
        warn!(
            "Waiting for lock {path} failed, retrying in {}s: {error}",
            WAIT_RETRY_DELAY.as_secs()
        );
        tokio::time::sleep(WAIT_RETRY_DELAY).await;
        Ok(())
    }
}

/// Proof of holding a lock. Release it explicitly with [`LockGuard::release`]; a guard that
/// is simply dropped keeps the lock until its TTL runs out.
#[must_use]
#[clippy::has_significant_drop]
pub struct LockGuard {
    store: Arc<dyn KeyValueStore>,
    path: String,
    holder: String,
    released: bool,
}

impl Debug for LockGuard {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.path)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Release the lock. Failures are logged, not returned: the TTL bounds how long a lock we
    /// failed to remove can linger, and a lock taken over by someone else after expiry must
    /// stay in place.
    pub async fn release(mut self) {
        self.released = true;
        match self.store.delete_if(&self.path, &self.holder).await {
            Ok(()) => debug!("Released lock {}", self.path),
            Err(StoreError::NotFound(_)) => {
                warn!("Lock {} expired before it was released", self.path);
            }
            Err(StoreError::CompareFailed(_)) => {
                warn!(
                    "Lock {} expired and was taken over by another process before it was released",
                    self.path
                );
            }
            Err(e) => error!("Failed to release lock {}: {e}", self.path),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                "Lock {} dropped without release, it stays held until it expires",
                self.path
            );
        }
    }
}
