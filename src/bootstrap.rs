//! Exactly-once creation of a shared resource across competing processes.
//!
//! ```text
//! ABSENT -> acquire lock -> HELD_BY_SELF  -> re-check, create, persist, release -> PRESENT
//!                        -> HELD_BY_OTHER -> wait for release -> start over
//! ```
//!
//! After waiting, the whole sequence starts over rather than trusting the other holder to
//! have finished: it may have crashed after taking the lock, leaving the resource absent.

use crate::error::{ServiceError, ServiceResult};
use crate::lock::{DistributedLock, LockError};
use async_trait::async_trait;
use tracing::{debug, info};

/// How often the state machine may start over before giving up
pub const MAX_BOOTSTRAP_ATTEMPTS: usize = 5;

/// A resource that must be created by exactly one process.
#[async_trait]
pub trait ExclusiveResource: Send + Sync {
    type Output: Send;

    /// Human readable name for logs and errors
    fn describe(&self) -> String;

    /// Store key of the lock guarding creation
    fn lock_path(&self) -> String;

    /// The resource if it is already complete. Must not write.
    async fn load(&self) -> ServiceResult<Option<Self::Output>>;

    /// Create and persist the resource. Only called while holding the lock.
    async fn create(&self) -> ServiceResult<Self::Output>;
}

/// Load `resource`, creating it under `lock` if no process has done so yet.
pub async fn bootstrap_exclusive<R>(lock: &DistributedLock, resource: &R) -> ServiceResult<R::Output>
where
    R: ExclusiveResource + ?Sized,
{
    let name = resource.describe();
    for attempt in 1..=MAX_BOOTSTRAP_ATTEMPTS {
        if let Some(existing) = resource.load().await? {
            debug!("{name} already present");
            return Ok(existing);
        }
        let path = resource.lock_path();
        match lock.acquire(&path).await {
            Ok(guard) => {
                // Another process may have finished between our load and the acquire
                let result = match resource.load().await {
                    Ok(Some(existing)) => Ok(existing),
                    Ok(None) => {
                        info!("Creating {name}");
                        resource.create().await
                    }
                    Err(e) => Err(e),
                };
                guard.release().await;
                return result;
            }
            Err(LockError::Held(_)) => {
                info!("{name} is being created by another process (attempt {attempt}), waiting");
                lock.wait_for_release(&path).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ServiceError::BootstrapExhausted {
        resource: name,
        attempts: MAX_BOOTSTRAP_ATTEMPTS,
    })
}
