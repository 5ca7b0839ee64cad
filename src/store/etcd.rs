use crate::store::{Entry, KeyValueStore, StoreError, StoreResult, WatchAction, WatchEvent};
use async_trait::async_trait;
use reqwest::{ClientBuilder, RequestBuilder, Response};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " reqwest/",
    env!("REQWEST_VERSION"),
);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// Error codes of the etcd v2 keys API
const ERROR_KEY_NOT_FOUND: u32 = 100;
const ERROR_TEST_FAILED: u32 = 101;
const ERROR_NODE_EXIST: u32 = 105;
const ERROR_EVENT_INDEX_CLEARED: u32 = 401;

#[derive(Debug, Deserialize)]
struct KeysResponse {
    action: WatchAction,
    node: Node,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Node {
    key: String,
    value: Option<String>,
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeysError {
    error_code: u32,
    message: String,
    #[serde(default)]
    cause: Option<String>,
}

/// [`KeyValueStore`] backed by the etcd v2 keys API.
///
/// Requests go to the endpoint that answered last; connection failures fall through to the
/// remaining endpoints in order. Every request except watches is bounded by `timeout`.
#[derive(Debug)]
pub struct EtcdStore {
    client: reqwest::Client,
    endpoints: Vec<Url>,
    preferred: AtomicUsize,
    timeout: Duration,
}

impl EtcdStore {
    pub fn try_new(endpoints: Vec<Url>, timeout: Duration) -> StoreResult<Self> {
        if endpoints.is_empty() {
            return Err(StoreError::NoEndpoints);
        }
        let client = ClientBuilder::new()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoints,
            preferred: AtomicUsize::new(0),
            timeout,
        })
    }

    fn key_url(endpoint: &Url, key: &str) -> StoreResult<Url> {
        let path = format!("v2/keys/{}", key.trim_start_matches('/'));
        endpoint
            .join(&path)
            .map_err(|e| StoreError::Protocol(format!("invalid key {key}: {e}")))
    }

    async fn execute<F>(&self, key: &str, bounded: bool, build: F) -> StoreResult<Response>
    where
        F: Fn(Url) -> RequestBuilder + Send + Sync,
    {
        let start = self.preferred.load(Ordering::Relaxed);
        let mut last_error = StoreError::NoEndpoints;
        for offset in 0..self.endpoints.len() {
            let index = (start + offset) % self.endpoints.len();
            let endpoint = &self.endpoints[index];
            let mut request = build(Self::key_url(endpoint, key)?);
            if bounded {
                request = request.timeout(self.timeout);
            }
            match request.send().await {
                Ok(response) => {
                    self.preferred.store(index, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(err) if err.is_connect() => {
                    warn!("etcd endpoint {endpoint} unreachable, trying next endpoint: {err}");
                    last_error = err.into();
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_error)
    }

    /// Decode a keys API response. Failures reported by etcd itself are handed back as
    /// [`KeysError`] so callers can interpret codes that only matter to them.
    async fn decode(
        response: Response,
        key: &str,
    ) -> StoreResult<Result<KeysResponse, KeysError>> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.map(Ok).map_err(|e| {
                StoreError::Protocol(format!("undecodable response for {key}: {e}"))
            });
        }
        response.json::<KeysError>().await.map(Err).map_err(|_| {
            StoreError::Protocol(format!("unexpected HTTP status {status} for {key}"))
        })
    }

    async fn decode_or_map(response: Response, key: &str) -> StoreResult<KeysResponse> {
        Self::decode(response, key)
            .await?
            .map_err(|error| Self::map_error(error, key))
    }

    fn map_error(error: KeysError, key: &str) -> StoreError {
        match error.error_code {
            ERROR_KEY_NOT_FOUND => StoreError::NotFound(key.to_string()),
            ERROR_TEST_FAILED => StoreError::CompareFailed(key.to_string()),
            ERROR_NODE_EXIST => StoreError::AlreadyExists(key.to_string()),
            code => StoreError::Protocol(format!(
                "{} (code {code}{})",
                error.message,
                error
                    .cause
                    .map(|cause| format!(", cause {cause}"))
                    .unwrap_or_default()
            )),
        }
    }

    fn into_entry(response: KeysResponse) -> StoreResult<Entry> {
        let node = response.node;
        let value = node
            .value
            .ok_or_else(|| StoreError::Protocol(format!("{} is a directory", node.key)))?;
        Ok(Entry {
            key: node.key,
            value,
            revision: node.modified_index,
        })
    }
}

#[async_trait]
impl KeyValueStore for EtcdStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Entry>> {
        let response = self
            .execute(key, true, |url| self.client.get(url))
            .await?;
        match Self::decode_or_map(response, key).await {
            Ok(response) => Self::into_entry(response).map(Some),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<Entry> {
        let response = self
            .execute(key, true, |url| self.client.put(url).form(&[("value", value)]))
            .await?;
        Self::into_entry(Self::decode_or_map(response, key).await?)
    }

    async fn create(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<Entry> {
        let ttl = ttl.as_secs().max(1).to_string();
        let response = self
            .execute(key, true, |url| {
                self.client
                    .put(url)
                    .query(&[("prevExist", "false")])
                    .form(&[("value", value), ("ttl", ttl.as_str())])
            })
            .await?;
        Self::into_entry(Self::decode_or_map(response, key).await?)
    }

    async fn delete_if(&self, key: &str, expected: &str) -> StoreResult<()> {
        let response = self
            .execute(key, true, |url| {
                self.client.delete(url).query(&[("prevValue", expected)])
            })
            .await?;
        Self::decode_or_map(response, key).await?;
        Ok(())
    }

    async fn watch(&self, key: &str, after: Option<u64>) -> StoreResult<WatchEvent> {
        let wait_index = after.map(|revision| (revision + 1).to_string());
        debug!("Watching {key} from index {wait_index:?}");
        let response = self
            .execute(key, false, |url| {
                let request = self.client.get(url).query(&[("wait", "true")]);
                match &wait_index {
                    Some(index) => request.query(&[("waitIndex", index.as_str())]),
                    None => request,
                }
            })
            .await?;
        let response = match Self::decode(response, key).await? {
            Ok(response) => response,
            Err(error) if error.error_code == ERROR_EVENT_INDEX_CLEARED => {
                return Err(StoreError::HistoryCompacted {
                    key: key.to_string(),
                    revision: after.unwrap_or_default(),
                });
            }
            Err(error) => return Err(Self::map_error(error, key)),
        };
        Ok(WatchEvent {
            action: response.action,
            key: response.node.key,
            value: response.node.value,
            revision: response.node.modified_index,
        })
    }
}
