//! Shared key-value store abstraction.
//!
//! All coordination happens through a handful of primitive operations that every
//! replicated store we care about offers: plain reads and writes, a create-if-absent write
//! with a time-to-live, a delete that only succeeds while the value still matches, and a
//! single-shot watch on one key. There are no multi-key transactions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Default namespace for every key written by this crate
pub const DEFAULT_PREFIX: &str = "/certsync";
/// Upper bound for any single non-watch store request
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key {0} already exists")]
    AlreadyExists(String),
    #[error("key {0} not found")]
    NotFound(String),
    #[error("compare failed for key {0}: value does not match")]
    CompareFailed(String),
    #[error("watch on key {key} cannot resume: history before revision {revision} was cleared")]
    HistoryCompacted { key: String, revision: u64 },
    #[error("store request timed out")]
    TimedOut,
    #[error("store request failed")]
    Http(#[source] reqwest::Error),
    #[error("store protocol error: {0}")]
    Protocol(String),
    #[error("no store endpoint configured")]
    NoEndpoints,
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::TimedOut
        } else {
            StoreError::Http(err)
        }
    }
}

/// A key together with its current value and the store revision of its last modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: String,
    pub revision: u64,
}

/// The kind of change a watch observed. Names follow the etcd v2 action vocabulary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum WatchAction {
    Get,
    Set,
    Create,
    Update,
    CompareAndSwap,
    Delete,
    CompareAndDelete,
    Expire,
}

impl WatchAction {
    /// Whether the key is gone after this event
    pub fn is_removal(self) -> bool {
        matches!(
            self,
            WatchAction::Delete | WatchAction::CompareAndDelete | WatchAction::Expire
        )
    }

    /// Whether the event wrote new content to the key
    pub fn is_mutation(self) -> bool {
        !self.is_removal() && self != WatchAction::Get
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub key: String,
    pub value: Option<String>,
    pub revision: u64,
}

#[async_trait]
pub trait KeyValueStore: Debug + Send + Sync {
    /// Read a key. A missing key is `Ok(None)`.
    async fn get(&self, key: &str) -> StoreResult<Option<Entry>>;

    /// Unconditionally write a key, without expiry.
    async fn set(&self, key: &str, value: &str) -> StoreResult<Entry>;

    /// Write a key only if it does not exist yet. The key expires after `ttl`.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`] if the key is present.
    async fn create(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<Entry>;

    /// Delete a key only if its current value equals `expected`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the key is absent, [`StoreError::CompareFailed`] if the
    /// key holds a different value.
    async fn delete_if(&self, key: &str, expected: &str) -> StoreResult<()>;

    /// Wait for the next change of `key`.
    ///
    /// With `after = Some(revision)` the first event with a revision strictly greater than
    /// `revision` is returned, even if it happened before this call. With `after = None`
    /// only changes made after the call started are observed. The returned future is
    /// cancel-safe: dropping it abandons the watch.
    async fn watch(&self, key: &str, after: Option<u64>) -> StoreResult<WatchEvent>;
}

/// Maps logical records onto store keys below a common prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_end_matches('/');
        let prefix = if trimmed.is_empty() || trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn account_registration(&self, identity: &str) -> String {
        format!("{}/accounts/{identity}/registration", self.prefix)
    }

    pub fn account_key(&self, identity: &str) -> String {
        format!("{}/accounts/{identity}/key", self.prefix)
    }

    pub fn account_lock(&self, identity: &str) -> String {
        format!("{}/accounts/{identity}/lock", self.prefix)
    }

    pub fn certificate(&self, primary_domain: &str) -> String {
        format!("{}/certificates/{primary_domain}.cert", self.prefix)
    }

    pub fn certificate_key(&self, primary_domain: &str) -> String {
        format!("{}/certificates/{primary_domain}.key", self.prefix)
    }

    pub fn certificate_metadata(&self, primary_domain: &str) -> String {
        format!("{}/certificates/{primary_domain}.json", self.prefix)
    }

    pub fn certificate_pem(&self, primary_domain: &str) -> String {
        format!("{}/certificates/{primary_domain}.pem", self.prefix)
    }

    pub fn certificate_lock(&self, primary_domain: &str) -> String {
        format!("{}/certificates/{primary_domain}.lock", self.prefix)
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl Display for KeyLayout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix)
    }
}

/// Open the store behind the configured endpoints.
///
/// `memory://` selects a process-local [`MemoryStore`] (useful for a single instance or for
/// trying things out); any `http(s)://` endpoint list selects an etcd cluster.
pub fn open(endpoints: &[Url], timeout: Duration) -> StoreResult<Arc<dyn KeyValueStore>> {
    if endpoints.is_empty() {
        return Err(StoreError::NoEndpoints);
    }
    if endpoints.iter().all(|endpoint| endpoint.scheme() == "memory") {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = EtcdStore::try_new(endpoints.to_vec(), timeout)?;
    Ok(Arc::new(store))
}
