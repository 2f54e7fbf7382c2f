//! Engine-level error types.

use morango_core::certificates::CertificateError;
use thiserror::Error;

/// Errors surfaced by sync operations, the HTTP layer, and the client.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("nonce does not exist")]
    NonceDoesNotExist,

    #[error("nonce has expired")]
    NonceExpired,

    #[error("server does not allow certificate pushing")]
    CertPushNotAllowed,

    #[error("limit of {limit} instance counters exceeded with {actual}")]
    LimitExceeded { limit: usize, actual: usize },

    #[error("cannot resume sync: {0}")]
    ResumeSync(String),

    #[error("context field already set: {0}")]
    ContextUpdate(&'static str),

    #[error("sync session {0} does not exist or is no longer active")]
    SyncSessionNotFound(String),

    #[error("transfer session {0} does not exist or is no longer active")]
    TransferSessionNotFound(String),

    #[error("certificate {0} does not exist")]
    CertificateNotFound(String),

    #[error("scope definition {0} does not exist")]
    ScopeDefinitionNotFound(String),

    #[error("filter is not within certificate scope: {0}")]
    FilterNotInScope(String),

    #[error("invalid buffer data: {0}")]
    InvalidBuffer(String),

    #[error("profile mismatch: {actual} vs {expected}")]
    ProfileMismatch { actual: String, expected: String },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("remote returned status {status}: {body}")]
    RemoteStatus { status: u16, body: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Malformed(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}

impl SyncError {
    /// HTTP status this error maps to when surfaced by the API layer.
    #[must_use]
    pub fn http_status(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            SyncError::Certificate(CertificateError::ScopeNotSubset)
            | SyncError::FilterNotInScope(_)
            | SyncError::CertPushNotAllowed => StatusCode::FORBIDDEN,
            SyncError::Certificate(_)
            | SyncError::NonceDoesNotExist
            | SyncError::NonceExpired
            | SyncError::SyncSessionNotFound(_)
            | SyncError::TransferSessionNotFound(_)
            | SyncError::CertificateNotFound(_)
            | SyncError::ScopeDefinitionNotFound(_)
            | SyncError::InvalidBuffer(_)
            | SyncError::ProfileMismatch { .. }
            | SyncError::Malformed(_)
            | SyncError::LimitExceeded { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
