//! Error types and stable error codes for the sync layer.

use crate::connection::machine::TransitionError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no credential available")]
    AuthMissing,

    #[error("credential has expired")]
    CredentialExpired,

    #[error("connection manager is closed")]
    Closed,

    #[error("not connected")]
    NotConnected,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connection manager stopped")]
    ManagerStopped,
}

impl SyncError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::AuthMissing => "auth_missing",
            Self::CredentialExpired => "credential_expired",
            Self::Closed => "closed",
            Self::NotConnected => "not_connected",
            Self::InvalidUrl(_) => "invalid_url",
            Self::Transport(_) => "transport",
            Self::Encode(_) => "encode",
            Self::ManagerStopped => "manager_stopped",
        }
    }

    /// Credential failures never enter the reconnect loop.
    pub fn is_credential_failure(&self) -> bool {
        matches!(self, Self::AuthMissing | Self::CredentialExpired)
    }
}

impl From<TransitionError> for SyncError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::AuthMissing => Self::AuthMissing,
            TransitionError::CredentialExpired => Self::CredentialExpired,
            TransitionError::Closed => Self::Closed,
        }
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}
