//! At-rest protection for marketplace credentials and session cookies.
//!
//! Secrets are sealed with RSA-OAEP (SHA-256) under a versioned keypair that
//! is persisted on disk, so stored ciphertext survives process restarts.

pub mod vault;

pub use vault::{KeyVersion, Vault};

use thiserror::Error;

/// Errors raised while sealing secrets or managing keys.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("plaintext of {len} bytes exceeds the {max}-byte limit of the current key")]
    PlaintextTooLong { len: usize, max: usize },

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("key storage error: {0}")]
    KeyStorage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a ciphertext could not be opened. Callers treat every variant as
/// "credentials unusable, re-authentication required".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptionFailure {
    #[error("ciphertext is empty or does not match the key modulus")]
    Truncated,

    #[error("ciphertext was sealed under unknown key version {0}")]
    UnknownKeyVersion(KeyVersion),

    #[error("ciphertext rejected (wrong key or corrupted bytes)")]
    Rejected,

    #[error("decrypted bytes are not valid UTF-8")]
    NotUtf8,
}
