use crate::store::{Entry, KeyValueStore, StoreError, StoreResult, WatchAction, WatchEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Number of past events kept around so that watches can resume from a revision
const HISTORY_LIMIT: usize = 1024;

#[derive(Debug)]
struct StoredValue {
    value: String,
    revision: u64,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, StoredValue>,
    revision: u64,
    history: VecDeque<WatchEvent>,
}

impl State {
    fn record(&mut self, action: WatchAction, key: &str, value: Option<String>) -> u64 {
        self.revision += 1;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(WatchEvent {
            action,
            key: key.to_string(),
            value,
            revision: self.revision,
        });
        self.revision
    }

    fn expire(&mut self, now: Instant) -> bool {
        let mut expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, stored)| stored.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        expired.sort();
        for key in &expired {
            self.entries.remove(key);
            self.record(WatchAction::Expire, key, None);
        }
        !expired.is_empty()
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|stored| stored.expires_at)
            .min()
    }

    fn entry(&self, key: &str) -> Option<Entry> {
        self.entries.get(key).map(|stored| Entry {
            key: key.to_string(),
            value: stored.value.clone(),
            revision: stored.revision,
        })
    }
}

/// A process-local [`KeyValueStore`].
///
/// Honors the same contract as a replicated store (TTL expiry, conditional writes,
/// resumable watches), which makes it suitable for single-instance deployments and for
/// exercising the coordination logic with several simulated processes in one test.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    revision_tx: watch::Sender<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            revision_tx,
        }
    }

    /// Current store revision. Every write, delete or expiry increments it, reads do not.
    pub fn revision(&self) -> u64 {
        let mut state = self.state.lock();
        self.expire_locked(&mut state);
        state.revision
    }

    /// All live keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut state = self.state.lock();
        self.expire_locked(&mut state);
        let mut keys: Vec<String> = state.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn expire_locked(&self, state: &mut State) {
        if state.expire(Instant::now()) {
            self.revision_tx.send_replace(state.revision);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Entry>> {
        let mut state = self.state.lock();
        self.expire_locked(&mut state);
        Ok(state.entry(key))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<Entry> {
        let mut state = self.state.lock();
        self.expire_locked(&mut state);
        let revision = state.record(WatchAction::Set, key, Some(value.to_string()));
        state.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                revision,
                expires_at: None,
            },
        );
        self.revision_tx.send_replace(revision);
        Ok(Entry {
            key: key.to_string(),
            value: value.to_string(),
            revision,
        })
    }

    async fn create(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<Entry> {
        let mut state = self.state.lock();
        self.expire_locked(&mut state);
        if state.entries.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        let revision = state.record(WatchAction::Create, key, Some(value.to_string()));
        state.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                revision,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        self.revision_tx.send_replace(revision);
        Ok(Entry {
            key: key.to_string(),
            value: value.to_string(),
            revision,
        })
    }

    async fn delete_if(&self, key: &str, expected: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        self.expire_locked(&mut state);
        match state.entries.get(key) {
            None => return Err(StoreError::NotFound(key.to_string())),
            Some(stored) if stored.value != expected => {
                return Err(StoreError::CompareFailed(key.to_string()));
            }
            Some(_) => {}
        }
        state.entries.remove(key);
        let revision = state.record(WatchAction::CompareAndDelete, key, None);
        self.revision_tx.send_replace(revision);
        Ok(())
    }

    async fn watch(&self, key: &str, after: Option<u64>) -> StoreResult<WatchEvent> {
        let mut changes = self.revision_tx.subscribe();
        let after = match after {
            Some(revision) => revision,
            None => self.revision(),
        };
        loop {
            let next_expiry = {
                let mut state = self.state.lock();
                self.expire_locked(&mut state);
                if let Some(oldest) = state.history.front().map(|event| event.revision) {
                    if after + 1 < oldest {
                        return Err(StoreError::HistoryCompacted {
                            key: key.to_string(),
                            revision: after,
                        });
                    }
                }
                if let Some(event) = state
                    .history
                    .iter()
                    .find(|event| event.revision > after && event.key == key)
                {
                    return Ok(event.clone());
                }
                state.next_expiry()
            };
            match next_expiry {
                Some(deadline) => {
                    tokio::select! {
                        _ = changes.changed() => {}
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    // The sender lives as long as the store itself
                    let _ = changes.changed().await;
                }
            }
        }
    }
}
