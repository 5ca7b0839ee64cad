//! Account Record Store: the CA account identity shared by every process.

use crate::authority::CertificateAuthority;
use crate::crypto::{Curve, KeyPair, KeyType, PRIVATE_KEY_TAGS, new_key};
use crate::error::{RecordError, RecordResult};
use crate::store::{KeyLayout, KeyValueStore};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Account keys are always ECDSA P-384, independent of the certificate key type.
pub const ACCOUNT_KEY_TYPE: KeyType = KeyType::Ecdsa(Curve::P384);

/// What the CA told us about our account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    #[serde(default)]
    pub terms_of_service_agreed: bool,
    /// Terms of service document the account agreed to, if the CA names one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<String>,
}

impl Registration {
    pub fn has_agreed_to_terms(&self) -> bool {
        self.terms_of_service_agreed || self.agreement.as_ref().is_some_and(|a| !a.is_empty())
    }
}

#[derive(Clone)]
pub struct Account {
    pub email: String,
    pub registration: Option<Registration>,
    pub key: Option<Arc<KeyPair>>,
}

impl Debug for Account {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("email", &self.email)
            .field("registration", &self.registration)
            .field("key", &self.key.as_ref().map(|key| key.key_type()))
            .finish()
    }
}

impl Account {
    /// A new, unregistered account with fresh key material. Nothing is persisted.
    pub fn generate_key(email: &str) -> RecordResult<Self> {
        let key = new_key(ACCOUNT_KEY_TYPE).map_err(RecordError::Crypto)?;
        Ok(Self::with_key(email, Arc::new(key)))
    }

    pub fn with_key(email: &str, key: Arc<KeyPair>) -> Self {
        Self {
            email: email.to_string(),
            registration: None,
            key: Some(key),
        }
    }

    pub fn has_agreed_to_terms(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(Registration::has_agreed_to_terms)
    }

    /// Register this account with the CA and keep the returned registration. The caller
    /// persists the result.
    pub async fn register(&mut self, ca: &dyn CertificateAuthority) -> anyhow::Result<()> {
        let registration = ca.register(self).await?;
        self.registration = Some(registration);
        Ok(())
    }

    pub async fn agree_to_terms(&mut self, ca: &dyn CertificateAuthority) -> anyhow::Result<()> {
        let registration = ca.agree_to_terms(self).await?;
        self.registration = Some(registration);
        Ok(())
    }
}

#[derive(Clone)]
pub struct AccountStore {
    store: Arc<dyn KeyValueStore>,
    layout: KeyLayout,
}

impl Debug for AccountStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountStore")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl AccountStore {
    pub fn new(store: Arc<dyn KeyValueStore>, layout: KeyLayout) -> Self {
        Self { store, layout }
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Load a complete account. A missing registration or key is [`RecordError::NotFound`].
    pub async fn load(&self, email: &str) -> RecordResult<Account> {
        let registration = self
            .load_registration(email)
            .await?
            .ok_or_else(|| RecordError::NotFound(self.layout.account_registration(email)))?;
        let key = self
            .load_key(email)
            .await?
            .ok_or_else(|| RecordError::NotFound(self.layout.account_key(email)))?;
        Ok(Account {
            email: email.to_string(),
            registration: Some(registration),
            key: Some(key),
        })
    }

    pub async fn load_registration(&self, email: &str) -> RecordResult<Option<Registration>> {
        let path = self.layout.account_registration(email);
        let Some(entry) = self.store.get(&path).await? else {
            return Ok(None);
        };
        serde_json::from_str(&entry.value)
            .map(Some)
            .map_err(|e| RecordError::malformed(&path, e))
    }

    pub async fn load_key(&self, email: &str) -> RecordResult<Option<Arc<KeyPair>>> {
        let path = self.layout.account_key(email);
        let Some(entry) = self.store.get(&path).await? else {
            return Ok(None);
        };
        let key = parse_private_key(&path, &entry.value)?;
        Ok(Some(Arc::new(key)))
    }

    /// Write the registration (if any), then the key (if any). The two writes are
    /// independent; a crash in between leaves a partially persisted account behind.
    pub async fn save(&self, account: &Account) -> RecordResult<()> {
        if let Some(registration) = &account.registration {
            let path = self.layout.account_registration(&account.email);
            let json = serde_json::to_string(registration)
                .map_err(|e| RecordError::malformed(&path, e))?;
            self.store.set(&path, &json).await?;
            debug!("Saved account registration {path}");
        }
        if let Some(key) = &account.key {
            let path = self.layout.account_key(&account.email);
            let pem = key.to_legacy_pem().map_err(RecordError::Crypto)?;
            self.store.set(&path, &pem.to_string()).await?;
            debug!("Saved account key {path}");
        }
        Ok(())
    }
}

/// Parse a stored private key, insisting on a PEM label we understand.
pub(crate) fn parse_private_key(path: &str, value: &str) -> RecordResult<KeyPair> {
    let block = pem::parse(value).map_err(|e| RecordError::malformed(path, e))?;
    if !PRIVATE_KEY_TAGS.contains(&block.tag()) {
        return Err(RecordError::UnknownKeyType(block.tag().to_string()));
    }
    KeyPair::from_pem(value).map_err(|e| RecordError::malformed(path, format!("{e:#}")))
}
