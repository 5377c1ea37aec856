//! Errors surfaced to a session's client.
//!
//! Every variant is terminal for the current command only; the session stays
//! open and the client may retry.

use crate::services::storage_service::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("key not found")]
    CredentialNotFound,
    #[error("must have username set")]
    InvalidIdentity,
    #[error("you do not have access to this service")]
    NotEntitled,
    #[error("{0} not set on session context, validate the session first")]
    SessionNotValidated(&'static str),
    #[error("invalid path `{0}`")]
    InvalidPath(String),
    #[error("{0}")]
    ObjectNotFound(String),
    #[error("storage quota exceeded: {used} of {max} bytes in use, upload needs {requested}")]
    QuotaExceeded { used: u64, max: u64, requested: u64 },
    #[error("bucket `{0}` is not configured")]
    BucketNotConfigured(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

pub type AssetResult<T> = Result<T, AssetError>;

impl From<StorageError> for AssetError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::BucketNotFound(name) => AssetError::BucketNotConfigured(name),
            StorageError::ObjectNotFound { .. } => AssetError::ObjectNotFound(err.to_string()),
            StorageError::QuotaExceeded {
                used,
                max,
                requested,
            } => AssetError::QuotaExceeded {
                used,
                max,
                requested,
            },
            StorageError::InvalidObjectKey(key) => AssetError::InvalidPath(key),
            other => AssetError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for AssetError {
    fn from(err: sqlx::Error) -> Self {
        AssetError::StorageUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_onto_client_taxonomy() {
        let err: AssetError = StorageError::BucketNotFound("static-x".into()).into();
        assert!(matches!(err, AssetError::BucketNotConfigured(name) if name == "static-x"));

        let err: AssetError = StorageError::ObjectNotFound {
            bucket: "static-x".into(),
            key: "blog/a.md".into(),
        }
        .into();
        assert!(matches!(err, AssetError::ObjectNotFound(msg) if msg.contains("blog/a.md")));

        let err: AssetError = StorageError::Io(std::io::Error::other("disk gone")).into();
        assert!(matches!(err, AssetError::StorageUnavailable(msg) if msg.contains("disk gone")));
    }

    #[test]
    fn quota_error_reports_numbers() {
        let err: AssetError = StorageError::QuotaExceeded {
            used: 90,
            max: 100,
            requested: 20,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "storage quota exceeded: 90 of 100 bytes in use, upload needs 20"
        );
    }
}
