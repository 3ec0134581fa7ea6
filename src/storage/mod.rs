//! Per-user persistence: encrypted credentials, session cookie, seen-set.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::core::{Result, UserId};
use crate::scanner::SeenSet;

/// Opaque ciphertext blobs produced by the vault. Plaintext never lands here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialRecord {
    pub login_cipher: Option<Vec<u8>>,
    pub password_cipher: Option<Vec<u8>>,
    pub cookie_cipher: Option<Vec<u8>>,
}

impl CredentialRecord {
    /// A stored cookie is what marks a user as tracked.
    pub fn tracking_enabled(&self) -> bool {
        self.cookie_cipher.is_some()
    }

    pub fn has_login(&self) -> bool {
        self.login_cipher.is_some() && self.password_cipher.is_some()
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Create the user's row on first contact; no-op afterwards.
    async fn ensure_user(&self, user_id: UserId) -> Result<()>;

    /// Unknown users load as an empty record.
    async fn load_credentials(&self, user_id: UserId) -> Result<CredentialRecord>;

    async fn save_login(
        &self,
        user_id: UserId,
        login_cipher: Vec<u8>,
        password_cipher: Vec<u8>,
    ) -> Result<()>;

    /// Unconditionally store a session cookie, enabling tracking.
    async fn store_cookie(&self, user_id: UserId, cookie_cipher: Vec<u8>) -> Result<()>;

    /// Replace the cookie only while tracking is still enabled. Returns
    /// `false` when a disable got there first and nothing was written.
    async fn refresh_cookie(&self, user_id: UserId, cookie_cipher: Vec<u8>) -> Result<bool>;

    async fn clear_cookie(&self, user_id: UserId) -> Result<()>;

    /// Clear the cookie only if it is still `expected`. Returns `false` when
    /// a newer cookie replaced it and nothing was cleared.
    async fn clear_cookie_if(&self, user_id: UserId, expected: &[u8]) -> Result<bool>;

    async fn load_seen_ids(&self, user_id: UserId) -> Result<SeenSet>;

    /// Replace the whole snapshot.
    async fn save_seen_ids(&self, user_id: UserId, seen: &SeenSet) -> Result<()>;

    /// Users whose cookie is set.
    async fn tracked_users(&self) -> Result<Vec<UserId>>;
}
