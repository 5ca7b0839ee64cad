use crate::authority::IssuanceFailure;
use crate::lock::LockError;
use crate::store::StoreError;

pub type ServiceResult<T> = Result<T, ServiceError>;
pub type RecordResult<T> = Result<T, RecordError>;

/// Failures while reading or writing account and certificate records.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("no record stored under {0}")]
    NotFound(String),
    #[error("unknown private key type {0}")]
    UnknownKeyType(String),
    #[error("stored record {key} is malformed: {reason}")]
    MalformedState { key: String, reason: String },
    #[error("a combined PEM bundle requires the certificate's private key, which is not known")]
    NoPrivateKeyForPem,
    #[error(transparent)]
    Crypto(anyhow::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RecordError {
    pub(crate) fn malformed(key: &str, reason: impl ToString) -> Self {
        RecordError::MalformedState {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(
        "the certificate authority's terms of service have not been accepted; rerun with --accept-tos to agree to them"
    )]
    TermsNotAccepted,
    #[error(transparent)]
    Issuance(#[from] IssuanceFailure),
    #[error(transparent)]
    Authority(anyhow::Error),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("gave up bootstrapping {resource} after {attempts} attempts")]
    BootstrapExhausted { resource: String, attempts: usize },
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        ServiceError::Record(RecordError::Store(err))
    }
}
