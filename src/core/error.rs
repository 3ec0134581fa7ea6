use thiserror::Error;

use super::UserId;
use crate::crypto::{DecryptionFailure, VaultError};

/// Sentinel used when the marketplace rejects a request without saying why.
pub const UNKNOWN_ERROR: &str = "unknown error";

#[derive(Error, Debug)]
pub enum TrackerError {
    /// Bad credentials or the marketplace refused the login.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("credentials unusable, re-authentication required: {0}")]
    Decryption(#[from] DecryptionFailure),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("user {0} has not stored marketplace credentials")]
    NotAuthenticated(UserId),

    #[error("tracking is disabled for user {0}")]
    TrackingDisabled(UserId),
}

impl TrackerError {
    /// True for failures that should switch tracking off instead of retrying.
    pub fn is_auth(&self) -> bool {
        matches!(self, TrackerError::Auth(_))
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(err: reqwest::Error) -> Self {
        TrackerError::Network(err.to_string())
    }
}

impl From<sqlx::Error> for TrackerError {
    fn from(err: sqlx::Error) -> Self {
        TrackerError::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;
